//! Session record: one isolated unit of user resource ownership.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::provider::ResourceHandle;

/// Handle of the one background task a session may run at a time.
struct TaskHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
    /// Cancelled by the task wrapper once the slot has been cleared, whatever
    /// the outcome; lets `stop_task` wait for settlement without consuming
    /// the join handle.
    settled: CancellationToken,
}

/// One session: identity, sandbox handle, task slot, activity bookkeeping.
///
/// The record is shared behind an `Arc`; interior mutability keeps each
/// mutation a single non-suspending step so check-and-set invariants hold
/// under cooperative scheduling.
pub struct SessionRecord {
    pub session_id: String,
    /// Opaque owner metadata, used only for logging.
    pub owner: String,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    /// The exclusively owned sandbox handle. `None` outside the window
    /// between successful acquisition and teardown; a new acquisition always
    /// installs a new handle, never resurrects an old one.
    resource: AsyncMutex<Option<Arc<dyn ResourceHandle>>>,
    task: Mutex<Option<TaskHandle>>,
}

impl SessionRecord {
    pub fn new(session_id: String, owner: String) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            session_id,
            owner,
            created_at: now,
            last_activity: Mutex::new(now),
            resource: AsyncMutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        *self.last_activity.lock().unwrap() = Instant::now() - by;
    }

    /// Lock the resource slot. Held across the acquisition await so two
    /// concurrent start requests serialize instead of double-acquiring.
    pub async fn resource_slot(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Option<Arc<dyn ResourceHandle>>> {
        self.resource.lock().await
    }

    /// Transient clone of the sandbox handle for use inside a task step.
    pub async fn resource(&self) -> Option<Arc<dyn ResourceHandle>> {
        self.resource.lock().await.clone()
    }

    pub async fn has_resource(&self) -> bool {
        self.resource.lock().await.is_some()
    }

    /// Detach the sandbox handle for teardown. Once taken it is gone for
    /// good; a later acquisition starts from scratch.
    pub async fn take_resource(&self) -> Option<Arc<dyn ResourceHandle>> {
        self.resource.lock().await.take()
    }

    /// Launch the session's background task.
    ///
    /// The occupancy check and slot install are one synchronous step; the
    /// suspending work happens only inside the spawned task, so two
    /// interleaved starts cannot both win. Rejected starts leave the running
    /// task untouched.
    ///
    /// The wrapper is the cancellation boundary: when the token fires the
    /// task body is dropped at its next suspension point, and the slot is
    /// cleared on every outcome. Bodies are expected to report their own
    /// errors through the notifier before returning.
    pub fn start_task<F, Fut>(self: &Arc<Self>, make: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.task.lock().unwrap();
        if let Some(handle) = slot.as_ref() {
            if !handle.join.is_finished() {
                return Err(Error::TaskRunning(self.session_id.clone()));
            }
        }

        let cancel = CancellationToken::new();
        let settled = CancellationToken::new();
        let body = make(cancel.clone());

        let record = Arc::downgrade(self);
        let token = cancel.clone();
        let done = settled.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("task cancelled");
                }
                _ = body => {}
            }
            if let Some(record) = record.upgrade() {
                record.clear_task();
            }
            done.cancel();
        });

        *slot = Some(TaskHandle {
            join,
            cancel,
            settled,
        });
        Ok(())
    }

    fn clear_task(&self) {
        *self.task.lock().unwrap() = None;
    }

    pub fn task_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.join.is_finished())
            .unwrap_or(false)
    }

    /// Whether the current task generation has been asked to stop. Resets to
    /// false when the task settles and the slot clears.
    pub fn stop_requested(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Request cancellation of the running task and wait up to `grace` for it
    /// to settle. Returns false if no task was running.
    ///
    /// A grace timeout is logged and otherwise ignored: the token is set, the
    /// task will stop at its next suspension point, and the sandbox teardown
    /// path reclaims whatever it leaves behind.
    pub async fn stop_task(&self, grace: Duration) -> bool {
        let (cancel, settled) = {
            let slot = self.task.lock().unwrap();
            match slot.as_ref() {
                Some(handle) if !handle.join.is_finished() => {
                    (handle.cancel.clone(), handle.settled.clone())
                }
                _ => return false,
            }
        };

        cancel.cancel();
        if tokio::time::timeout(grace, settled.cancelled()).await.is_err() {
            warn!(
                session_id = %self.session_id,
                "task did not settle within grace period; continuing"
            );
        }
        true
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        // A record dropped without going through teardown must not leave its
        // task running detached.
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let record = SessionRecord::new("s".into(), "tester".into());
        record
            .start_task(|cancel| async move {
                cancel.cancelled().await;
            })
            .unwrap();

        let err = record
            .start_task(|_| async move {})
            .expect_err("slot occupied");
        assert!(matches!(err, Error::TaskRunning(_)));
        assert!(record.task_running());

        record.stop_task(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn slot_clears_after_completion_and_allows_restart() {
        let record = SessionRecord::new("s".into(), "tester".into());
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        record
            .start_task(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Let the task finish and the wrapper clear the slot.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!record.task_running());
        assert!(!record.stop_requested());

        let counter = ran.clone();
        record
            .start_task(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_settles_within_grace() {
        let record = SessionRecord::new("s".into(), "tester".into());
        record
            .start_task(|_| async move {
                // Never finishes on its own.
                std::future::pending::<()>().await;
            })
            .unwrap();

        assert!(record.stop_task(Duration::from_secs(3)).await);
        assert!(!record.task_running());
        assert!(!record.stop_requested());
    }

    #[tokio::test]
    async fn stop_without_task_reports_false() {
        let record = SessionRecord::new("s".into(), "tester".into());
        assert!(!record.stop_task(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn cooperative_body_sees_stop_request() {
        let record = SessionRecord::new("s".into(), "tester".into());
        let steps = Arc::new(AtomicUsize::new(0));

        let counter = steps.clone();
        record
            .start_task(move |cancel| async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(record.stop_task(Duration::from_secs(1)).await);
        let after_stop = steps.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // No further steps once the token fired.
        assert_eq!(steps.load(Ordering::SeqCst), after_stop);
    }
}
