//! WebSocket endpoint: one connection per browser tab.
//!
//! The socket splits into a send half driven by an mpsc channel (the sender
//! registered with the connection registry) and a receive loop parsing client
//! actions. A connection is mute until the client identifies a session.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actions::DEFAULT_OWNER;
use crate::event::Event;
use crate::state::{AppState, Domain};

/// Actions a client may send on the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    /// Bind this connection to a session, flushing any queued events.
    IdentifySession {
        session_id: String,
        #[serde(default)]
        domain: Option<Domain>,
    },
    /// Drop events queued for the bound session.
    ClearLogs,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let conn = state.registry.register(tx.clone());

    // Greeting goes through the channel so ordering with later events holds.
    let _ = tx.send(Event::info("Connected to event stream"));

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "failed to serialize event");
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable client message");
                let _ = tx.send(Event::error("Unrecognized message"));
                continue;
            }
        };

        match parsed {
            ClientMessage::IdentifySession { session_id, domain } => {
                if let Err(e) = state.registry.associate(conn, &session_id) {
                    let _ = tx.send(Event::error(e.to_string()));
                    continue;
                }
                // Identifying creates the session if the client minted the id
                // before its first HTTP call.
                let domain = domain.unwrap_or(Domain::ComputerUse);
                state
                    .store(domain)
                    .get_or_create(&session_id, DEFAULT_OWNER)
                    .await;
                info!(session_id = %session_id, "websocket identified session");
                let _ = tx.send(Event::info(format!("Session identified: {session_id}")));
            }
            ClientMessage::ClearLogs => {
                if let Some(session_id) = state.registry.session_of(conn) {
                    state.registry.clear_pending(&session_id);
                    let _ = tx.send(Event::info("Logs cleared"));
                }
            }
        }
    }

    send_task.abort();
    let _ = (&mut send_task).await;
    state.registry.disconnect(conn);
    debug!("websocket closed");
}
