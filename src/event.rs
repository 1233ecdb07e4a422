//! Event envelope delivered to browser clients over WebSocket.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator for user-visible events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Error,
    Stdout,
    Stderr,
    Screenshot,
    TaskCompleted,
    DesktopStarted,
    DesktopKilled,
    Action,
    ActionCompleted,
    Reasoning,
}

/// A single notification addressed to a session.
///
/// Producers never talk to individual connections; they hand envelopes to the
/// [`Notifier`](crate::notify::Notifier) keyed by session id and the
/// connection registry resolves fan-out versus queuing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Wall-clock time of creation, second precision.
    pub timestamp: String,
    /// Free-form payload: a string for log lines, a nested object for
    /// screenshot / desktop_started style events.
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            data,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventKind::Info, Value::String(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, Value::String(message.into()))
    }

    pub fn stdout(line: impl Into<String>) -> Self {
        Self::new(EventKind::Stdout, Value::String(line.into()))
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self::new(EventKind::Stderr, Value::String(line.into()))
    }

    pub fn task_completed(message: impl Into<String>) -> Self {
        Self::new(EventKind::TaskCompleted, Value::String(message.into()))
    }

    pub fn screenshot(base64_png: impl Into<String>) -> Self {
        Self::new(EventKind::Screenshot, Value::String(base64_png.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let event = Event::info("hello");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "info");
        assert_eq!(value["data"], "hello");
        // HH:MM:SS
        assert_eq!(value["timestamp"].as_str().unwrap().len(), 8);
    }

    #[test]
    fn nested_payloads_survive_round_trip() {
        let event = Event::new(
            EventKind::DesktopStarted,
            json!({ "sandbox_id": "sb-1", "stream_url": "https://x" }),
        );
        let back: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back, event);
    }
}
