//! Fan-out facade handed to background tasks and collaborator callbacks.

use std::sync::Arc;

use serde_json::Value;

use crate::event::{Event, EventKind};
use crate::registry::ConnectionRegistry;

/// Addressable event sink: producers name a session, the registry decides
/// between immediate fan-out and queuing.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn send(&self, session_id: &str, event: Event) {
        self.registry.send_to_session(session_id, event);
    }

    pub fn info(&self, session_id: &str, message: impl Into<String>) {
        self.send(session_id, Event::info(message));
    }

    pub fn error(&self, session_id: &str, message: impl Into<String>) {
        self.send(session_id, Event::error(message));
    }

    pub fn stdout(&self, session_id: &str, line: impl Into<String>) {
        self.send(session_id, Event::stdout(line));
    }

    pub fn stderr(&self, session_id: &str, line: impl Into<String>) {
        self.send(session_id, Event::stderr(line));
    }

    pub fn event(&self, session_id: &str, kind: EventKind, data: Value) {
        self.send(session_id, Event::new(kind, data));
    }

    /// Operator notices only; never used for per-task event streams.
    pub fn broadcast(&self, event: Event) {
        self.registry.broadcast(event);
    }
}
