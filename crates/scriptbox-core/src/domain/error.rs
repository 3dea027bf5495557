//! Engine-level error taxonomy for scriptbox.
//!
//! These are errors of the *engine* (submission, lookup, configuration).
//! Faults raised by executing script text never surface here; they are
//! classified into an [`ExecutionResult`](super::ExecutionResult) instead.

use super::outcome::SessionId;
use super::submission::ContextId;

/// Scriptbox engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("context {context_id} already has an active session {session_id}")]
    AlreadyRunning {
        context_id: ContextId,
        session_id: SessionId,
    },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("output of session {0} is already subscribed")]
    AlreadySubscribed(SessionId),

    #[error("session {0} is still active")]
    StillActive(SessionId),

    #[error("result of session {0} is unavailable")]
    ResultUnavailable(SessionId),

    #[error("worker failed to start: {0}")]
    WorkerUnavailable(String),

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for scriptbox engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
