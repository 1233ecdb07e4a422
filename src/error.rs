//! Core error type.

/// Errors surfaced by the session/connection engine.
///
/// Lookup misses are deliberately *not* represented here: `get`-style
/// operations return `Option` and unknown-id sends/disconnects are no-ops.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("a task is already running in session {0}")]
    TaskRunning(String),

    #[error("no task is running in session {0}")]
    NoTaskRunning(String),

    #[error("connection is already associated with session {0}")]
    AlreadyAssociated(String),

    #[error("no desktop resource available for session {0}")]
    NoResource(String),

    #[error("resource acquisition failed: {0}")]
    Acquire(String),

    #[error("sandbox operation failed: {0}")]
    Sandbox(String),

    #[error("unknown domain: {0}")]
    UnknownDomain(String),
}

pub type Result<T> = std::result::Result<T, Error>;
