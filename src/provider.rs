//! Contracts for the external sandbox SDK and the automation engine.
//!
//! The core never talks to a cloud vendor directly; it drives whatever
//! implements these traits. [`crate::demo`] ships an in-process pair so the
//! backend runs without credentials, and tests substitute their own doubles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Parameters for acquiring a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ResourceConfig {
    pub template: Option<String>,
    /// Provider-side auto-kill timeout, seconds.
    pub timeout_secs: u64,
    pub metadata: HashMap<String, String>,
}

/// Per-line output callback for background commands.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback matching the notifier envelope shape; collaborators emit events
/// through it without knowing about sessions or connections.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// A command started inside a sandbox.
#[async_trait]
pub trait CommandHandle: Send + Sync {
    /// Wait for completion. Potentially unbounded; callers rely on explicit
    /// stop requests rather than a provider-side timeout.
    async fn wait(&self) -> anyhow::Result<i32>;

    fn cancel(&self);
}

/// A live sandbox. Exclusively owned by its session record; background tasks
/// borrow transient clones that die with the task.
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    fn id(&self) -> &str;

    /// URL of the live desktop stream, once the stream is up.
    fn stream_url(&self) -> Option<String>;

    async fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()>;

    async fn run_command(
        &self,
        command: &str,
        on_stdout: LineCallback,
        on_stderr: LineCallback,
    ) -> anyhow::Result<Box<dyn CommandHandle>>;

    /// Current screen as base64-encoded PNG.
    async fn screenshot(&self) -> anyhow::Result<String>;

    /// Tear down the sandbox. Idempotent; a second call must be a no-op and
    /// must not fail.
    async fn teardown(&self);
}

/// Creates sandboxes. Acquisition failures must leave no live partial state
/// behind (a started stream without an agent is the provider's to unwind).
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn acquire(&self, config: &ResourceConfig) -> anyhow::Result<Arc<dyn ResourceHandle>>;
}

/// The agent loop that actually performs automation work. Implementations
/// must observe the cancellation token at every externally visible step so a
/// stop request takes effect within one step.
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    async fn run(
        &self,
        resource: Arc<dyn ResourceHandle>,
        query: &str,
        events: EventCallback,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;
}
