//! In-process stand-ins for the cloud sandbox SDK and the agent loop.
//!
//! The backend is a demo; these let it run end to end without credentials
//! and double as the test collaborators for the lifecycle suite. A real
//! deployment swaps in provider/engine implementations backed by an actual
//! sandbox vendor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{Event, EventKind};
use crate::provider::{
    AutomationEngine, CommandHandle, EventCallback, LineCallback, ResourceConfig, ResourceHandle,
    ResourceProvider,
};

// 1x1 transparent PNG, enough for the screenshot event shape.
const PLACEHOLDER_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Fakes sandbox acquisition: hands out handles with a made-up stream URL
/// and scripted command output.
pub struct DemoProvider {
    teardowns: Arc<AtomicUsize>,
    /// When set, every acquisition fails; used to exercise the failure path.
    fail_acquire: AtomicBool,
}

impl DemoProvider {
    pub fn new() -> Self {
        Self {
            teardowns: Arc::new(AtomicUsize::new(0)),
            fail_acquire: AtomicBool::new(false),
        }
    }

    pub fn fail_next_acquisitions(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Total teardown calls across every handle this provider produced.
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

impl Default for DemoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProvider for DemoProvider {
    async fn acquire(&self, config: &ResourceConfig) -> anyhow::Result<Arc<dyn ResourceHandle>> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            anyhow::bail!("demo provider: acquisition disabled");
        }
        let sandbox_id = format!("demo-{}", uuid::Uuid::new_v4().simple());
        info!(
            sandbox_id = %sandbox_id,
            template = config.template.as_deref().unwrap_or("default"),
            "acquired demo sandbox"
        );
        Ok(Arc::new(DemoResource {
            sandbox_id: sandbox_id.clone(),
            stream_url: format!("https://stream.demo.local/{sandbox_id}?auth=demo"),
            killed: AtomicBool::new(false),
            files: Mutex::new(Vec::new()),
            teardowns: self.teardowns.clone(),
        }))
    }
}

struct DemoResource {
    sandbox_id: String,
    stream_url: String,
    killed: AtomicBool,
    files: Mutex<Vec<(String, String)>>,
    teardowns: Arc<AtomicUsize>,
}

impl DemoResource {
    fn ensure_alive(&self) -> anyhow::Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            anyhow::bail!("sandbox {} is gone", self.sandbox_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHandle for DemoResource {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    fn stream_url(&self) -> Option<String> {
        Some(self.stream_url.clone())
    }

    async fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        self.ensure_alive()?;
        self.files
            .lock()
            .unwrap()
            .push((path.to_string(), contents.to_string()));
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        on_stdout: LineCallback,
        on_stderr: LineCallback,
    ) -> anyhow::Result<Box<dyn CommandHandle>> {
        self.ensure_alive()?;
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let command = command.to_string();
        let token = cancel.clone();
        let finished = done.clone();
        tokio::spawn(async move {
            for i in 1..=3 {
                if token.is_cancelled() {
                    on_stderr(&format!("{command}: terminated"));
                    break;
                }
                on_stdout(&format!("{command}: step {i}/3"));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            finished.cancel();
        });

        Ok(Box::new(DemoCommand { cancel, done }))
    }

    async fn screenshot(&self) -> anyhow::Result<String> {
        self.ensure_alive()?;
        Ok(PLACEHOLDER_PNG_BASE64.to_string())
    }

    async fn teardown(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            info!(sandbox_id = %self.sandbox_id, "demo sandbox torn down");
        }
    }
}

struct DemoCommand {
    cancel: CancellationToken,
    done: CancellationToken,
}

#[async_trait]
impl CommandHandle for DemoCommand {
    async fn wait(&self) -> anyhow::Result<i32> {
        self.done.cancelled().await;
        Ok(if self.cancel.is_cancelled() { -1 } else { 0 })
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Scripted agent: a fixed number of observe/act steps with the token
/// checked before each one.
pub struct DemoEngine {
    pub steps: usize,
    pub step_delay: Duration,
}

impl Default for DemoEngine {
    fn default() -> Self {
        Self {
            steps: 3,
            step_delay: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl AutomationEngine for DemoEngine {
    async fn run(
        &self,
        resource: Arc<dyn ResourceHandle>,
        query: &str,
        events: EventCallback,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        events(Event::new(
            EventKind::Reasoning,
            json!(format!("Planning steps for: {query}")),
        ));

        for step in 1..=self.steps {
            if cancel.is_cancelled() {
                return Ok(format!("stopped after {} of {} steps", step - 1, self.steps));
            }
            events(Event::new(
                EventKind::Action,
                json!({ "step": step, "description": format!("simulated action {step}") }),
            ));
            tokio::time::sleep(self.step_delay).await;
            let screenshot = resource.screenshot().await?;
            events(Event::screenshot(screenshot));
            events(Event::new(
                EventKind::ActionCompleted,
                json!({ "step": step }),
            ));
        }

        Ok(format!("completed {} steps", self.steps))
    }
}
