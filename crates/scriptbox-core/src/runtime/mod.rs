//! Executing runtimes.
//!
//! The session manager depends only on [`ScriptRuntime`]. A runtime runs on
//! the session's blocking worker thread, so `execute` is synchronous.

mod builtins;
pub mod lua;

use std::sync::Arc;

use crate::capability::CapabilityRegistry;
use crate::classifier::Termination;
use crate::domain::{ContextId, SessionId};
use crate::session::CancelToken;
use crate::sink::OutputSink;

pub use lua::LuaRuntime;

/// Interpreter limits applied to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub check_interval: u32,
    pub memory_limit_bytes: Option<usize>,
    pub chunk_name: String,
}

/// Everything a worker may touch while running one script.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub session_id: SessionId,
    pub context_id: ContextId,
    pub registry: Arc<CapabilityRegistry>,
    pub sink: Arc<OutputSink>,
    pub cancel: CancelToken,
    pub limits: ExecutionLimits,
}

/// Executes script text under a capability registry.
///
/// Implementations must never panic on bad script input and must honor
/// `ctx.cancel` at their check points by returning
/// [`Termination::Interrupted`].
pub trait ScriptRuntime: Send + Sync {
    /// Runtime name for logs.
    fn name(&self) -> &'static str;

    fn execute(&self, source: &str, ctx: &WorkerContext) -> Termination;
}
