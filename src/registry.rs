//! Connection registry: session-to-WebSocket fan-out and pending queues.
//!
//! The registry maps session ids to the set of live connections watching that
//! session. Events addressed to a session with no attached connection are
//! buffered in a bounded per-session queue and flushed, in order, to the next
//! connection that identifies itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Event;

/// Sending half of a connection. The WebSocket handler owns the receiving
/// half and forwards events onto the socket.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Opaque handle for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[derive(Default)]
struct Inner {
    /// Connection -> its sender. Present for every registered connection,
    /// associated or not.
    senders: HashMap<ConnectionId, EventSender>,
    /// Session -> attached connections (fan-out set).
    session_conns: HashMap<String, HashSet<ConnectionId>>,
    /// Connection -> session, for O(1) disconnect.
    conn_session: HashMap<ConnectionId, String>,
    /// Events buffered while a session has no attached connections.
    pending: HashMap<String, VecDeque<Event>>,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    pending_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            pending_capacity,
        }
    }

    /// Register a freshly accepted connection. The connection receives
    /// nothing until it is associated with a session.
    pub fn register(&self, sender: EventSender) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().unwrap();
        inner.senders.insert(id, sender);
        debug!(conn = id.0, "registered connection");
        id
    }

    /// Bind a connection to a session and flush any queued events to it.
    ///
    /// A connection belongs to at most one session. Re-associating with the
    /// same session is a no-op; re-associating with a different session is
    /// rejected rather than silently moving the connection, which would
    /// orphan the old session's fan-out set.
    pub fn associate(&self, conn: ConnectionId, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.senders.contains_key(&conn) {
            // Connection already gone; nothing to bind.
            return Ok(());
        }
        if let Some(existing) = inner.conn_session.get(&conn) {
            if existing == session_id {
                return Ok(());
            }
            return Err(Error::AlreadyAssociated(existing.clone()));
        }

        inner
            .session_conns
            .entry(session_id.to_string())
            .or_default()
            .insert(conn);
        inner.conn_session.insert(conn, session_id.to_string());
        info!(session_id = %session_id, conn = conn.0, "connection associated");

        // Flush queued events to this connection only, in FIFO order, then
        // drop the queue. A failed send means the socket died mid-flush; the
        // remaining events are lost with it.
        if let Some(queue) = inner.pending.remove(session_id) {
            if !queue.is_empty() {
                info!(
                    session_id = %session_id,
                    count = queue.len(),
                    "flushing queued events to new connection"
                );
            }
            let sender = inner.senders.get(&conn).cloned();
            if let Some(sender) = sender {
                for event in queue {
                    if sender.send(event).is_err() {
                        self.disconnect_locked(&mut inner, conn);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove a connection. Unknown connections are a no-op. The session's
    /// pending queue is kept so a later reconnect still sees events generated
    /// in the gap.
    pub fn disconnect(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        self.disconnect_locked(&mut inner, conn);
    }

    fn disconnect_locked(&self, inner: &mut Inner, conn: ConnectionId) {
        inner.senders.remove(&conn);
        if let Some(session_id) = inner.conn_session.remove(&conn) {
            if let Some(set) = inner.session_conns.get_mut(&session_id) {
                set.remove(&conn);
                if set.is_empty() {
                    inner.session_conns.remove(&session_id);
                }
            }
            info!(session_id = %session_id, conn = conn.0, "connection removed");
        }
    }

    /// Deliver an event to every connection attached to the session, or queue
    /// it if none are. Connections whose send fails are pruned; delivery
    /// continues to the remaining ones.
    pub fn send_to_session(&self, session_id: &str, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        let conns: Vec<ConnectionId> = inner
            .session_conns
            .get(session_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if conns.is_empty() {
            let queue = inner.pending.entry(session_id.to_string()).or_default();
            queue.push_back(event);
            while queue.len() > self.pending_capacity {
                queue.pop_front();
            }
            return;
        }

        let mut dead = Vec::new();
        for conn in conns {
            match inner.senders.get(&conn) {
                Some(sender) if sender.send(event.clone()).is_ok() => {}
                _ => dead.push(conn),
            }
        }
        for conn in dead {
            warn!(session_id = %session_id, conn = conn.0, "send failed, pruning connection");
            self.disconnect_locked(&mut inner, conn);
        }
    }

    /// Send an event to every session with at least one attached connection.
    /// Operator notices only; per-task event streams always go through
    /// [`send_to_session`](Self::send_to_session).
    pub fn broadcast(&self, event: Event) {
        let session_ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.session_conns.keys().cloned().collect()
        };
        for session_id in session_ids {
            self.send_to_session(&session_id, event.clone());
        }
    }

    /// Session a connection is bound to, if any.
    pub fn session_of(&self, conn: ConnectionId) -> Option<String> {
        self.inner.lock().unwrap().conn_session.get(&conn).cloned()
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .session_conns
            .get(session_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pending
            .get(session_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drop queued events for a session without touching its connections.
    pub fn clear_pending(&self, session_id: &str) {
        if self.inner.lock().unwrap().pending.remove(session_id).is_some() {
            info!(session_id = %session_id, "cleared pending queue");
        }
    }

    /// Forget a session: fan-out set and pending queue. Called from session
    /// teardown only. Attached connections revert to registered-but-unbound;
    /// their sockets stay open and may identify another session.
    pub fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(session_id);
        if let Some(set) = inner.session_conns.remove(session_id) {
            for conn in set {
                inner.conn_session.remove(&conn);
            }
        }
    }
}
