//! Generic session store, instantiated once per resource domain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::registry::ConnectionRegistry;
use crate::session::SessionRecord;

/// Authoritative registry of session records for one domain (desktop,
/// browser-use, computer-use, code-interpreter). All four domains share this
/// one implementation; only the domain label and the resources stored on the
/// records differ.
pub struct SessionStore {
    pub domain: &'static str,
    sessions: RwLock<HashMap<String, Arc<SessionRecord>>>,
    registry: Arc<ConnectionRegistry>,
    session_timeout: Duration,
    sweep_interval: Duration,
    stop_grace: Duration,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(
        domain: &'static str,
        registry: Arc<ConnectionRegistry>,
        session_timeout: Duration,
        sweep_interval: Duration,
        stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain,
            sessions: RwLock::new(HashMap::new()),
            registry,
            session_timeout,
            sweep_interval,
            stop_grace,
            sweep: Mutex::new(None),
        })
    }

    /// Create a session with a fresh id.
    pub async fn create(self: &Arc<Self>, owner: &str) -> Arc<SessionRecord> {
        let session_id = format!("session_{}", uuid::Uuid::new_v4().simple());
        self.insert(session_id, owner).await
    }

    /// Look up a session, touching its activity timestamp. Absent ids return
    /// `None`, never an error.
    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        let record = self.sessions.read().await.get(session_id).cloned();
        if let Some(record) = &record {
            record.touch();
        }
        record
    }

    /// Look up a session or create one under the client-supplied id. Clients
    /// that minted their own id before the first request keep it verbatim.
    pub async fn get_or_create(self: &Arc<Self>, session_id: &str, owner: &str) -> Arc<SessionRecord> {
        if let Some(record) = self.get(session_id).await {
            return record;
        }
        self.insert(session_id.to_string(), owner).await
    }

    async fn insert(self: &Arc<Self>, session_id: String, owner: &str) -> Arc<SessionRecord> {
        let record = SessionRecord::new(session_id.clone(), owner.to_string());
        // Honor a concurrent insert under the same id rather than clobbering
        // its record.
        let record = {
            let mut sessions = self.sessions.write().await;
            sessions.entry(session_id.clone()).or_insert(record).clone()
        };
        info!(domain = self.domain, session_id = %session_id, owner = %record.owner, "created session");
        self.ensure_sweep();
        record
    }

    /// Remove a session and tear down everything it owns. Returns false if
    /// the id is unknown; a second call after a successful removal is false
    /// and runs no teardown.
    pub async fn remove(&self, session_id: &str) -> bool {
        let record = self.sessions.write().await.remove(session_id);
        match record {
            Some(record) => {
                self.teardown(record).await;
                info!(domain = self.domain, session_id = %session_id, "removed session");
                true
            }
            None => false,
        }
    }

    /// The record is already detached from the map, so nothing here can
    /// deadlock against a lookup, and the running task being cancelled was
    /// never waiting on this lock.
    async fn teardown(&self, record: Arc<SessionRecord>) {
        record.stop_task(self.stop_grace).await;
        if let Some(resource) = record.take_resource().await {
            info!(
                domain = self.domain,
                session_id = %record.session_id,
                sandbox_id = resource.id(),
                "tearing down sandbox"
            );
            resource.teardown().await;
        }
        self.registry.remove_session(&record.session_id);
    }

    /// Remove every session idle beyond the timeout. Each teardown runs in
    /// its own failure boundary; one bad session never stops the sweep.
    pub async fn sweep_expired(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, record)| record.is_expired(self.session_timeout))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in expired {
            info!(domain = self.domain, session_id = %session_id, "sweeping expired session");
            self.remove(&session_id).await;
        }
    }

    pub async fn list(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Spawn the periodic sweep if it is not already running. At most one
    /// sweep task per store.
    fn ensure_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock().unwrap();
        if sweep.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }
        let store = Arc::downgrade(self);
        let period = self.sweep_interval;
        *sweep = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => store.sweep_expired().await,
                    None => break,
                }
            }
        }));
    }

    /// Stop the sweep and tear down all remaining sessions.
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweep.lock().unwrap().take() {
            task.abort();
        }
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in ids {
            self.remove(&session_id).await;
        }
        info!(domain = self.domain, "store shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoProvider;
    use crate::provider::{ResourceConfig, ResourceProvider};

    fn store(timeout: Duration) -> Arc<SessionStore> {
        let registry = Arc::new(ConnectionRegistry::new(1000));
        SessionStore::new(
            "desktop",
            registry,
            timeout,
            Duration::from_secs(300),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn get_or_create_honors_client_supplied_id() {
        let store = store(Duration::from_secs(3600));
        let record = store.get_or_create("session_client_made", "alice").await;
        assert_eq!(record.session_id, "session_client_made");

        let again = store.get_or_create("session_client_made", "alice").await;
        assert!(Arc::ptr_eq(&record, &again));
    }

    #[tokio::test]
    async fn get_of_unknown_id_is_none() {
        let store = store(Duration::from_secs(3600));
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_tears_down_once() {
        let store = store(Duration::from_secs(3600));
        let provider = DemoProvider::new();
        let record = store.create("alice").await;

        let resource = provider.acquire(&ResourceConfig::default()).await.unwrap();
        let probe = provider.teardown_count();
        *record.resource_slot().await = Some(resource);

        assert!(store.remove(&record.session_id).await);
        assert_eq!(provider.teardown_count(), probe + 1);
        assert!(!store.remove(&record.session_id).await);
        assert_eq!(provider.teardown_count(), probe + 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let store = store(Duration::from_secs(60));
        let stale = store.create("alice").await;
        let fresh = store.create("bob").await;
        stale.backdate_activity(Duration::from_secs(120));

        store.sweep_expired().await;

        assert!(store.get(&stale.session_id).await.is_none());
        assert!(store.get(&fresh.session_id).await.is_some());
    }

    #[tokio::test]
    async fn sweep_invokes_resource_teardown() {
        let store = store(Duration::from_secs(60));
        let provider = DemoProvider::new();
        let record = store.create("alice").await;
        *record.resource_slot().await =
            Some(provider.acquire(&ResourceConfig::default()).await.unwrap());
        record.backdate_activity(Duration::from_secs(120));

        let before = provider.teardown_count();
        store.sweep_expired().await;
        assert_eq!(provider.teardown_count(), before + 1);
    }

    #[tokio::test]
    async fn remove_cancels_running_task() {
        let store = store(Duration::from_secs(3600));
        let record = store.create("alice").await;
        record
            .start_task(|cancel| async move {
                cancel.cancelled().await;
            })
            .unwrap();

        assert!(store.remove(&record.session_id).await);
        assert!(!record.task_running());
    }

    #[tokio::test]
    async fn shutdown_drains_all_sessions() {
        let store = store(Duration::from_secs(3600));
        store.create("alice").await;
        store.create("bob").await;
        store.shutdown().await;
        assert_eq!(store.len().await, 0);
    }
}
