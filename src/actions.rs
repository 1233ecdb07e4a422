//! Session-facing action flows: start/setup/run/stop/kill/screenshot.
//!
//! These are the bodies behind the HTTP handlers, kept free of axum types so
//! the lifecycle suite can drive them directly.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::provider::{EventCallback, LineCallback, ResourceConfig};
use crate::session::SessionRecord;
use crate::state::{AppState, Domain};

/// Owner recorded when the action layer supplies none (login disabled).
pub const DEFAULT_OWNER: &str = "default_user";

#[derive(Debug)]
pub struct StartOutcome {
    pub session_id: String,
    pub sandbox_id: String,
    pub stream_url: Option<String>,
}

/// Resolve the target session: a supplied id is honored (creating the record
/// if the client minted the id itself), a missing id creates a fresh one.
pub async fn resolve_session(
    state: &AppState,
    domain: Domain,
    session_id: Option<&str>,
    owner: &str,
) -> Arc<SessionRecord> {
    let store = state.store(domain);
    match session_id {
        Some(id) => store.get_or_create(id, owner).await,
        None => store.create(owner).await,
    }
}

fn resource_config(state: &AppState, domain: Domain, session_id: &str) -> ResourceConfig {
    let mut config = ResourceConfig {
        template: state.config.template.clone(),
        timeout_secs: state.config.sandbox_timeout_secs,
        ..Default::default()
    };
    config.metadata.insert("purpose".into(), domain.as_str().into());
    config.metadata.insert("session_id".into(), session_id.into());
    config
}

/// Acquire a sandbox for the session and announce its stream URL.
///
/// Idempotent for a session that already holds a sandbox. On acquisition
/// failure the error is reported once to the session, the record is removed,
/// and the caller must issue a fresh start to retry.
pub async fn start_desktop(
    state: &AppState,
    domain: Domain,
    session_id: Option<&str>,
    owner: &str,
) -> Result<StartOutcome> {
    let record = resolve_session(state, domain, session_id, owner).await;
    let session_id = record.session_id.clone();
    state.notifier.info(&session_id, "Starting desktop stream...");

    // The slot stays locked across the acquire so a concurrent start waits
    // and then sees the installed handle instead of acquiring twice.
    let mut slot = record.resource_slot().await;
    if let Some(resource) = slot.as_ref() {
        state
            .notifier
            .info(&session_id, "Desktop is already running for this session");
        return Ok(StartOutcome {
            session_id: session_id.clone(),
            sandbox_id: resource.id().to_string(),
            stream_url: resource.stream_url(),
        });
    }

    let config = resource_config(state, domain, &session_id);
    let resource = match state.provider.acquire(&config).await {
        Ok(resource) => resource,
        Err(e) => {
            error!(domain = domain.as_str(), session_id = %session_id, error = %e, "acquisition failed");
            state
                .notifier
                .error(&session_id, format!("Error starting desktop: {e}"));
            drop(slot);
            state.store(domain).remove(&session_id).await;
            return Err(Error::Acquire(e.to_string()));
        }
    };
    let sandbox_id = resource.id().to_string();
    let stream_url = resource.stream_url();
    *slot = Some(resource);
    drop(slot);

    info!(domain = domain.as_str(), session_id = %session_id, sandbox_id = %sandbox_id, "desktop started");
    state.notifier.event(
        &session_id,
        EventKind::DesktopStarted,
        json!({
            "session_id": session_id,
            "sandbox_id": sandbox_id,
            "stream_url": stream_url,
            "timeout": state.config.sandbox_timeout_secs,
        }),
    );
    state.notifier.info(
        &session_id,
        "Desktop stream is loading. Please wait for the display to appear before starting tasks...",
    );

    Ok(StartOutcome {
        session_id,
        sandbox_id,
        stream_url,
    })
}

/// Prepare the sandbox in the background: bootstrap file plus browser
/// install, streaming command output back to the session.
pub async fn setup_environment(state: &AppState, domain: Domain, session_id: &str) -> Result<()> {
    let record = state
        .store(domain)
        .get(session_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    if !record.has_resource().await {
        return Err(Error::NoResource(session_id.to_string()));
    }
    if record.task_running() {
        return Err(Error::TaskRunning(session_id.to_string()));
    }

    state
        .notifier
        .info(session_id, "Setting up environment in background...");

    let notifier = state.notifier.clone();
    let session = record.clone();
    record.start_task(move |cancel| async move {
        let session_id = session.session_id.clone();
        let Some(resource) = session.resource().await else {
            notifier.error(&session_id, "No desktop instance available");
            return;
        };

        notifier.info(&session_id, "Copying files to sandbox...");
        if let Err(e) = resource
            .write_file("/tmp/agent_runner.py", "# agent bootstrap\n")
            .await
        {
            notifier.error(&session_id, format!("Error copying files: {e}"));
            return;
        }
        notifier.info(&session_id, "Copied agent bootstrap to /tmp/agent_runner.py");

        notifier.info(&session_id, "Installing Playwright browser...");
        let stdout: LineCallback = {
            let notifier = notifier.clone();
            let session_id = session_id.clone();
            Arc::new(move |line| notifier.stdout(&session_id, line))
        };
        let stderr: LineCallback = {
            let notifier = notifier.clone();
            let session_id = session_id.clone();
            Arc::new(move |line| notifier.stderr(&session_id, line))
        };

        let command = match resource
            .run_command(
                "playwright install chromium --with-deps --no-shell",
                stdout,
                stderr,
            )
            .await
        {
            Ok(command) => command,
            Err(e) => {
                notifier.error(&session_id, format!("Error setting up environment: {e}"));
                return;
            }
        };

        let status = tokio::select! {
            status = command.wait() => status,
            _ = cancel.cancelled() => {
                command.cancel();
                return;
            }
        };
        match status {
            Ok(0) => notifier.info(&session_id, "Environment setup completed successfully"),
            Ok(code) => notifier.error(
                &session_id,
                format!("Environment setup failed with exit code: {code}"),
            ),
            Err(e) => notifier.error(&session_id, format!("Error setting up environment: {e}")),
        }
    })
}

/// Start an automation task for the session, acquiring a sandbox first if
/// none is attached yet. Rejects synchronously while another task runs.
pub async fn run_task(
    state: &AppState,
    domain: Domain,
    session_id: Option<&str>,
    owner: &str,
    query: &str,
) -> Result<String> {
    let record = resolve_session(state, domain, session_id, owner).await;
    let session_id = record.session_id.clone();

    if record.task_running() {
        return Err(Error::TaskRunning(session_id));
    }

    if !record.has_resource().await {
        info!(domain = domain.as_str(), session_id = %session_id, "no desktop yet, starting one");
        start_desktop(state, domain, Some(&session_id), owner).await?;
    }

    state
        .notifier
        .info(&session_id, format!("Running task: {query}"));

    let notifier = state.notifier.clone();
    let engine = state.engine.clone();
    let session = record.clone();
    let query = query.to_string();
    record.start_task(move |cancel| async move {
        let session_id = session.session_id.clone();
        let Some(resource) = session.resource().await else {
            notifier.error(&session_id, "No desktop instance available");
            return;
        };

        let events: EventCallback = {
            let notifier = notifier.clone();
            let session_id = session_id.clone();
            Arc::new(move |event: Event| notifier.send(&session_id, event))
        };

        match engine.run(resource, &query, events, cancel).await {
            Ok(summary) => {
                notifier.send(&session_id, Event::task_completed(format!("Task completed: {summary}")));
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "task failed");
                notifier.error(&session_id, format!("Error in task: {e}"));
            }
        }
    })?;

    Ok(record.session_id.clone())
}

/// Request cancellation of the session's running task.
///
/// Success means the stop was requested and a bounded settle wait elapsed;
/// eventual termination past the grace period is best-effort.
pub async fn stop_task(state: &AppState, domain: Domain, session_id: &str) -> Result<()> {
    let record = state
        .store(domain)
        .get(session_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    if !record.task_running() {
        return Err(Error::NoTaskRunning(session_id.to_string()));
    }

    state.notifier.info(session_id, "Stopping task...");
    record.stop_task(state.config.stop_grace).await;
    state.notifier.info(session_id, "Task stopped");
    Ok(())
}

/// Kill the session's sandbox and retire the session: cancel the task, tear
/// the resource down, drop the record.
pub async fn kill_desktop(state: &AppState, domain: Domain, session_id: &str) -> Result<()> {
    let record = state
        .store(domain)
        .get(session_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    if !record.has_resource().await {
        return Err(Error::NoResource(session_id.to_string()));
    }

    state
        .notifier
        .info(session_id, "Stopping desktop and any running task...");
    state.notifier.event(
        session_id,
        EventKind::DesktopKilled,
        json!("Desktop instance killed"),
    );
    // remove() cancels the task, tears the sandbox down, and unbinds the
    // session's connections; their sockets stay open for re-identification.
    state.store(domain).remove(session_id).await;
    Ok(())
}

/// Capture the current screen and push it to the session's connections.
pub async fn take_screenshot(state: &AppState, domain: Domain, session_id: &str) -> Result<()> {
    let record = state
        .store(domain)
        .get(session_id)
        .await
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    let resource = record
        .resource()
        .await
        .ok_or_else(|| Error::NoResource(session_id.to_string()))?;

    match resource.screenshot().await {
        Ok(png) => {
            state.notifier.send(session_id, Event::screenshot(png));
            Ok(())
        }
        Err(e) => {
            state
                .notifier
                .error(session_id, format!("Error taking screenshot: {e}"));
            Err(Error::Sandbox(e.to_string()))
        }
    }
}
