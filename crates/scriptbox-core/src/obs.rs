//! Structured observability hooks for the session lifecycle.
//!
//! Events are emitted at `info!` level, except the capability audit event
//! which is a `warn!`. Filtering follows `SCRIPTBOX_LOG`.

use tracing::{info, warn};

use crate::domain::{ContextId, ExecutionResult, SessionId};

/// RAII guard that enters a session-scoped span for the worker's lifetime.
///
/// ```ignore
/// let _span = SessionSpan::enter(&session_id, &context_id);
/// ```
pub struct SessionSpan {
    _span: tracing::span::EnteredSpan,
}

impl SessionSpan {
    pub fn enter(session_id: &SessionId, context_id: &ContextId) -> Self {
        let span = tracing::info_span!(
            "scriptbox.session",
            session_id = %session_id,
            context_id = %context_id,
        );
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_session_submitted(session_id: &SessionId, context_id: &ContextId, bytes: usize) {
    info!(
        event = "session.submitted",
        session_id = %session_id,
        context_id = %context_id,
        source_bytes = bytes,
    );
}

/// A submission was refused because the context already has an active session.
pub fn emit_session_rejected(context_id: &ContextId, active: &SessionId) {
    info!(
        event = "session.rejected",
        context_id = %context_id,
        active_session_id = %active,
    );
}

pub fn emit_session_started(runtime: &str) {
    info!(event = "session.started", runtime = runtime);
}

pub fn emit_cancel_requested(session_id: &SessionId) {
    info!(event = "session.cancel_requested", session_id = %session_id);
}

pub fn emit_timed_out(session_id: &SessionId, budget_ms: u64) {
    info!(event = "session.timed_out", session_id = %session_id, budget_ms = budget_ms);
}

pub fn emit_session_finished(result: &ExecutionResult) {
    let fault_kind = result.fault_kind().map(|k| k.to_string());
    info!(
        event = "session.finished",
        session_id = %result.session_id,
        context_id = %result.context_id,
        state = %result.state,
        duration_ms = result.duration_ms,
        fault_kind = fault_kind.as_deref().unwrap_or("none"),
    );
}

/// Audit event: script text tried to reach something outside the registry.
pub fn emit_capability_denied(session_id: &SessionId, symbol: &str, reason: &str) {
    warn!(
        event = "capability.denied",
        session_id = %session_id,
        symbol = symbol,
        reason = reason,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_span_create() {
        let _span = SessionSpan::enter(&SessionId::new(), &ContextId::new("A"));
    }
}
