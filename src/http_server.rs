//! HTTP API using Axum.
//!
//! Every action endpoint is fire-and-forget from the browser's point of
//! view: the response acknowledges the request and the interesting output
//! arrives as events on the session's WebSocket connections.

use crate::actions::{self, DEFAULT_OWNER};
use crate::error::Error;
use crate::state::{AppState, Domain};
use crate::ws;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// Request/Response types
#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    session_id: String,
    sandbox_id: String,
    stream_url: Option<String>,
}

#[derive(Deserialize)]
struct TaskRequest {
    query: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Serialize)]
struct TaskResponse {
    session_id: String,
    status: &'static str,
}

#[derive(Deserialize)]
struct SessionActionRequest {
    session_id: String,
}

#[derive(Serialize)]
struct SessionInfo {
    session_id: String,
    owner: String,
    age_secs: u64,
    idle_secs: u64,
    has_desktop: bool,
    task_running: bool,
    connections: usize,
    pending_events: usize,
}

fn http_error(e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        Error::TaskRunning(_) | Error::AlreadyAssociated(_) => StatusCode::CONFLICT,
        Error::NoTaskRunning(_) | Error::NoResource(_) | Error::UnknownDomain(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::Acquire(_) => StatusCode::BAD_GATEWAY,
        Error::Sandbox(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn parse_domain(raw: &str) -> Result<Domain, (StatusCode, String)> {
    Domain::parse(raw).map_err(http_error)
}

/// Run the HTTP server with the provided state.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;

    let app = Router::new()
        // Session management, per domain
        .route("/api/:domain/sessions", post(create_session))
        .route("/api/:domain/sessions", get(list_sessions))
        .route("/api/:domain/sessions/:id", get(get_session))
        .route("/api/:domain/sessions/:id", delete(delete_session))
        // Desktop / task actions
        .route("/api/:domain/start", post(start_desktop))
        .route("/api/:domain/setup", post(setup_environment))
        .route("/api/:domain/task", post(run_task))
        .route("/api/:domain/stop", post(stop_task))
        .route("/api/:domain/kill", post(kill_desktop))
        .route("/api/:domain/screenshot", post(take_screenshot))
        // Cross-domain status
        .route("/api/sessions/status", get(status))
        // Event stream
        .route("/ws", get(ws::ws_handler))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    let owner = req.owner.as_deref().unwrap_or(DEFAULT_OWNER);
    let record =
        actions::resolve_session(&state, domain, req.session_id.as_deref(), owner).await;
    Ok(Json(CreateSessionResponse {
        session_id: record.session_id.clone(),
    }))
}

async fn session_info(state: &AppState, record: &crate::session::SessionRecord) -> SessionInfo {
    SessionInfo {
        session_id: record.session_id.clone(),
        owner: record.owner.clone(),
        age_secs: record.created_at.elapsed().as_secs(),
        idle_secs: record.idle_for().as_secs(),
        has_desktop: record.has_resource().await,
        task_running: record.task_running(),
        connections: state.registry.connection_count(&record.session_id),
        pending_events: state.registry.pending_count(&record.session_id),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Vec<SessionInfo>>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    let mut list = Vec::new();
    for record in state.store(domain).list().await {
        list.push(session_info(&state, &record).await);
    }
    Ok(Json(list))
}

async fn get_session(
    State(state): State<AppState>,
    Path((domain, id)): Path<(String, String)>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    let record = state
        .store(domain)
        .get(&id)
        .await
        .ok_or_else(|| http_error(Error::SessionNotFound(id)))?;
    Ok(Json(session_info(&state, &record).await))
}

async fn delete_session(
    State(state): State<AppState>,
    Path((domain, id)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    if state.store(domain).remove(&id).await {
        info!("Deleted session: {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(http_error(Error::SessionNotFound(id)))
    }
}

async fn start_desktop(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    let owner = req.owner.as_deref().unwrap_or(DEFAULT_OWNER);
    let outcome = actions::start_desktop(&state, domain, req.session_id.as_deref(), owner)
        .await
        .map_err(http_error)?;
    Ok(Json(StartResponse {
        session_id: outcome.session_id,
        sandbox_id: outcome.sandbox_id,
        stream_url: outcome.stream_url,
    }))
}

async fn setup_environment(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<SessionActionRequest>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    actions::setup_environment(&state, domain, &req.session_id)
        .await
        .map_err(http_error)?;
    Ok(Json(TaskResponse {
        session_id: req.session_id,
        status: "setup_started",
    }))
}

async fn run_task(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    let owner = req.owner.as_deref().unwrap_or(DEFAULT_OWNER);
    let session_id =
        actions::run_task(&state, domain, req.session_id.as_deref(), owner, &req.query)
            .await
            .map_err(http_error)?;
    Ok(Json(TaskResponse {
        session_id,
        status: "started",
    }))
}

async fn stop_task(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<SessionActionRequest>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    actions::stop_task(&state, domain, &req.session_id)
        .await
        .map_err(http_error)?;
    Ok(Json(TaskResponse {
        session_id: req.session_id,
        status: "stopped",
    }))
}

async fn kill_desktop(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<SessionActionRequest>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    actions::kill_desktop(&state, domain, &req.session_id)
        .await
        .map_err(http_error)?;
    Ok(Json(TaskResponse {
        session_id: req.session_id,
        status: "killed",
    }))
}

async fn take_screenshot(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<SessionActionRequest>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let domain = parse_domain(&domain)?;
    actions::take_screenshot(&state, domain, &req.session_id)
        .await
        .map_err(http_error)?;
    Ok(Json(TaskResponse {
        session_id: req.session_id,
        status: "screenshot_sent",
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let mut domains = serde_json::Map::new();
    for domain in Domain::ALL {
        let mut sessions = Vec::new();
        for record in state.store(domain).list().await {
            sessions.push(session_info(&state, &record).await);
        }
        domains.insert(
            domain.as_str().to_string(),
            json!({
                "count": sessions.len(),
                "sessions": sessions,
            }),
        );
    }
    Json(Value::Object(domains))
}
