//! Domain model for scriptbox sessions.

pub mod error;
pub mod outcome;
pub mod submission;

pub use error::{EngineError, Result};
pub use outcome::{
    ExecutionResult, Fault, FaultKind, SessionHandle, SessionId, SessionSnapshot, SessionState,
    TraceFrame,
};
pub use submission::{ContextId, ScriptSubmission};
