//! Runtime configuration knobs.

use std::time::Duration;

/// Session idle timeout in seconds (1 hour).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

/// Expiry sweep interval in seconds (5 minutes). Kept materially smaller
/// than the timeout so staleness is bounded.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Maximum queued events per session while no connection is attached;
/// oldest entries are evicted beyond this.
pub const DEFAULT_PENDING_CAPACITY: usize = 1000;

/// Bounded wait for a stopped task to settle, in seconds.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub pending_capacity: usize,
    pub stop_grace: Duration,
    /// Sandbox template passed to the resource provider.
    pub template: Option<String>,
    /// Provider-side auto-kill timeout for acquired sandboxes, in seconds.
    pub sandbox_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            template: None,
            sandbox_timeout_secs: 1200,
        }
    }
}
