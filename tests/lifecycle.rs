//! End-to-end lifecycle tests driving the action layer and the connection
//! registry together, with the demo provider standing in for the sandbox SDK.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use deskbox::actions;
use deskbox::config::Config;
use deskbox::demo::{DemoEngine, DemoProvider};
use deskbox::event::{Event, EventKind};
use deskbox::registry::ConnectionId;
use deskbox::{AppState, Domain, Error};

fn test_state(engine: DemoEngine) -> (AppState, Arc<DemoProvider>) {
    let provider = Arc::new(DemoProvider::new());
    let config = Config {
        stop_grace: Duration::from_secs(3),
        ..Config::default()
    };
    let state = AppState::new(config, provider.clone(), Arc::new(engine));
    (state, provider)
}

fn connect(state: &AppState, session_id: &str) -> (ConnectionId, UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = state.registry.register(tx);
    state.registry.associate(conn, session_id).unwrap();
    (conn, rx)
}

fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn events_queue_while_disconnected_and_flush_on_reconnect() {
    let (state, _provider) = test_state(DemoEngine::default());
    let record = state.store(Domain::ComputerUse).create("alice").await;
    let sid = record.session_id.clone();

    // No connection yet: everything queues.
    state.notifier.info(&sid, "one");
    state.notifier.info(&sid, "two");
    assert_eq!(state.registry.pending_count(&sid), 2);

    // First connection drains the queue in order, then receives live.
    let (conn, mut rx) = connect(&state, &sid);
    let got = drain(&mut rx);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].data, "one");
    assert_eq!(got[1].data, "two");

    state.notifier.info(&sid, "three");
    let got = drain(&mut rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, "three");

    // Disconnect: later events queue again for the next connection.
    state.registry.disconnect(conn);
    state.notifier.info(&sid, "four");
    assert_eq!(state.registry.pending_count(&sid), 1);

    let (_conn2, mut rx2) = connect(&state, &sid);
    let got = drain(&mut rx2);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, "four");
}

#[tokio::test]
async fn second_task_rejected_then_stop_frees_the_slot() {
    // A long-running scripted agent so the slot stays occupied.
    let (state, _provider) = test_state(DemoEngine {
        steps: 1000,
        step_delay: Duration::from_millis(20),
    });

    let sid = actions::run_task(&state, Domain::ComputerUse, None, "alice", "book a flight")
        .await
        .unwrap();
    settle().await;

    let err = actions::run_task(&state, Domain::ComputerUse, Some(&sid), "alice", "another")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskRunning(_)));

    let started = tokio::time::Instant::now();
    actions::stop_task(&state, Domain::ComputerUse, &sid)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let record = state.store(Domain::ComputerUse).get(&sid).await.unwrap();
    assert!(!record.task_running());

    // The slot is free again.
    actions::run_task(&state, Domain::ComputerUse, Some(&sid), "alice", "retry")
        .await
        .unwrap();
}

#[tokio::test]
async fn stop_without_running_task_is_an_error() {
    let (state, _provider) = test_state(DemoEngine::default());
    let record = state.store(Domain::Desktop).create("alice").await;

    let err = actions::stop_task(&state, Domain::Desktop, &record.session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoTaskRunning(_)));
}

#[tokio::test]
async fn run_task_acquires_desktop_and_streams_events_to_completion() {
    let (state, _provider) = test_state(DemoEngine {
        steps: 2,
        step_delay: Duration::from_millis(10),
    });

    let record = state.store(Domain::ComputerUse).create("alice").await;
    let sid = record.session_id.clone();
    let (_conn, mut rx) = connect(&state, &sid);

    actions::run_task(&state, Domain::ComputerUse, Some(&sid), "alice", "order pizza")
        .await
        .unwrap();

    // Let the scripted agent run to completion.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let got = drain(&mut rx);
    let kinds: Vec<EventKind> = got.iter().map(|event| event.kind).collect();
    assert!(kinds.contains(&EventKind::DesktopStarted));
    assert!(kinds.contains(&EventKind::Action));
    assert!(kinds.contains(&EventKind::Screenshot));
    assert!(kinds.contains(&EventKind::TaskCompleted));

    // Slot cleared on completion.
    assert!(!record.task_running());
}

#[tokio::test]
async fn start_is_idempotent_while_desktop_is_live() {
    let (state, provider) = test_state(DemoEngine::default());

    let first = actions::start_desktop(&state, Domain::Desktop, None, "alice")
        .await
        .unwrap();
    let second = actions::start_desktop(&state, Domain::Desktop, Some(&first.session_id), "alice")
        .await
        .unwrap();

    assert_eq!(first.sandbox_id, second.sandbox_id);
    assert_eq!(first.stream_url, second.stream_url);
    assert_eq!(provider.teardown_count(), 0);
}

#[tokio::test]
async fn acquisition_failure_reports_error_and_drops_the_session() {
    let (state, provider) = test_state(DemoEngine::default());
    provider.fail_next_acquisitions(true);

    let record = state.store(Domain::Desktop).create("alice").await;
    let sid = record.session_id.clone();
    let (_conn, mut rx) = connect(&state, &sid);

    let err = actions::start_desktop(&state, Domain::Desktop, Some(&sid), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Acquire(_)));

    let got = drain(&mut rx);
    let errors: Vec<&Event> = got
        .iter()
        .filter(|event| event.kind == EventKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);

    // The record is gone; a retry starts from scratch.
    assert!(state.store(Domain::Desktop).get(&sid).await.is_none());
    provider.fail_next_acquisitions(false);
    actions::start_desktop(&state, Domain::Desktop, Some(&sid), "alice")
        .await
        .unwrap();
}

#[tokio::test]
async fn kill_tears_down_sandbox_and_retires_the_session() {
    let (state, provider) = test_state(DemoEngine::default());

    let outcome = actions::start_desktop(&state, Domain::Desktop, None, "alice")
        .await
        .unwrap();
    let sid = outcome.session_id;

    actions::kill_desktop(&state, Domain::Desktop, &sid)
        .await
        .unwrap();
    assert_eq!(provider.teardown_count(), 1);
    assert!(state.store(Domain::Desktop).get(&sid).await.is_none());

    let err = actions::kill_desktop(&state, Domain::Desktop, &sid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn connection_outlives_a_killed_session_and_rebinds() {
    let (state, _provider) = test_state(DemoEngine::default());

    let outcome = actions::start_desktop(&state, Domain::Desktop, None, "alice")
        .await
        .unwrap();
    let sid = outcome.session_id;
    let (conn, mut rx) = connect(&state, &sid);

    actions::kill_desktop(&state, Domain::Desktop, &sid)
        .await
        .unwrap();
    drain(&mut rx);

    // Same socket identifies a fresh session and receives its events live.
    let fresh = state.store(Domain::Desktop).create("alice").await;
    state.registry.associate(conn, &fresh.session_id).unwrap();
    state.notifier.info(&fresh.session_id, "back online");

    let got = drain(&mut rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, "back online");
    assert_eq!(state.registry.pending_count(&fresh.session_id), 0);
}

#[tokio::test]
async fn screenshot_requires_a_live_desktop() {
    let (state, _provider) = test_state(DemoEngine::default());
    let record = state.store(Domain::Desktop).create("alice").await;
    let sid = record.session_id.clone();

    let err = actions::take_screenshot(&state, Domain::Desktop, &sid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoResource(_)));

    actions::start_desktop(&state, Domain::Desktop, Some(&sid), "alice")
        .await
        .unwrap();
    let (_conn, mut rx) = connect(&state, &sid);
    actions::take_screenshot(&state, Domain::Desktop, &sid)
        .await
        .unwrap();

    let got = drain(&mut rx);
    assert!(got.iter().any(|event| event.kind == EventKind::Screenshot));
}

#[tokio::test]
async fn domains_keep_separate_session_stores() {
    let (state, _provider) = test_state(DemoEngine::default());

    let desktop = state.store(Domain::Desktop).create("alice").await;
    let browser = state.store(Domain::BrowserUse).create("alice").await;

    assert!(state
        .store(Domain::BrowserUse)
        .get(&desktop.session_id)
        .await
        .is_none());

    state.store(Domain::Desktop).remove(&desktop.session_id).await;
    assert!(state
        .store(Domain::BrowserUse)
        .get(&browser.session_id)
        .await
        .is_some());
}

#[tokio::test]
async fn setup_streams_command_output_and_frees_the_slot() {
    let (state, _provider) = test_state(DemoEngine::default());

    let outcome = actions::start_desktop(&state, Domain::ComputerUse, None, "alice")
        .await
        .unwrap();
    let sid = outcome.session_id;
    let (_conn, mut rx) = connect(&state, &sid);

    actions::setup_environment(&state, Domain::ComputerUse, &sid)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let got = drain(&mut rx);
    assert!(got.iter().any(|event| event.kind == EventKind::Stdout));
    assert!(got.iter().any(|event| {
        event.kind == EventKind::Info
            && event.data.as_str().map_or(false, |s| s.contains("completed"))
    }));

    let record = state.store(Domain::ComputerUse).get(&sid).await.unwrap();
    assert!(!record.task_running());
}

#[tokio::test]
async fn shutdown_tears_down_every_domain() {
    let (state, provider) = test_state(DemoEngine::default());

    actions::start_desktop(&state, Domain::Desktop, None, "alice")
        .await
        .unwrap();
    actions::start_desktop(&state, Domain::BrowserUse, None, "bob")
        .await
        .unwrap();

    state.shutdown().await;
    assert_eq!(provider.teardown_count(), 2);
    for domain in Domain::ALL {
        assert_eq!(state.store(domain).len().await, 0);
    }
}
