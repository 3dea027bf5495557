//! Session manager: at most one active session per context, and the
//! supervisor that drives each session to exactly one terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::capability::CapabilityRegistry;
use crate::classifier::{classify, Termination};
use crate::config::EngineConfig;
use crate::domain::{
    ContextId, EngineError, ExecutionResult, Result, ScriptSubmission, SessionHandle, SessionId,
    SessionSnapshot,
};
use crate::metrics::METRICS;
use crate::obs::{self, SessionSpan};
use crate::runtime::{LuaRuntime, ScriptRuntime, WorkerContext};
use crate::session::{lock, CancelToken, ExecutionSession};
use crate::sink::{self, OutputStream};

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<SessionId, Arc<ExecutionSession>>,
    /// Most recent session per context.
    current: HashMap<ContextId, SessionId>,
}

impl ManagerState {
    fn active_session(&self, context_id: &ContextId) -> Option<SessionId> {
        let id = self.current.get(context_id)?;
        let session = self.sessions.get(id)?;
        session.state().is_active().then_some(*id)
    }
}

/// Entry point for collaborators.
///
/// Cheap to clone; clones share the same sessions.
///
/// Terminated sessions stay tracked, with their results, until
/// [`SessionManager::release`] is called. Long-lived collaborators must
/// release every session once its result has been observed, or the session
/// table grows without bound.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<CapabilityRegistry>,
    runtime: Arc<dyn ScriptRuntime>,
    config: EngineConfig,
    state: Arc<Mutex<ManagerState>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Manager with the standard registry and the Lua runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_runtime(
            config,
            CapabilityRegistry::standard(),
            Arc::new(LuaRuntime::new()),
        )
    }

    pub fn with_runtime(
        config: EngineConfig,
        registry: CapabilityRegistry,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(registry),
            runtime,
            config,
            state: Arc::new(Mutex::new(ManagerState::default())),
        })
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a session for `submission`.
    ///
    /// Returns once the worker has moved the session to `Running`. Fails with
    /// [`EngineError::AlreadyRunning`] when the context already has a
    /// pending or running session; the submission is not queued.
    pub async fn submit(&self, submission: ScriptSubmission) -> Result<SessionHandle> {
        let ScriptSubmission {
            context_id,
            source_text,
            timeout_ms,
            ..
        } = submission;

        let session = {
            let mut state = lock(&self.state);
            if let Some(active) = state.active_session(&context_id) {
                METRICS.inc_rejected();
                obs::emit_session_rejected(&context_id, &active);
                return Err(EngineError::AlreadyRunning {
                    context_id,
                    session_id: active,
                });
            }

            let id = SessionId::new();
            let cancel = CancelToken::new();
            let (sink, stream) = sink::channel(
                self.config.output_buffer_chunks,
                self.config.max_output_bytes,
                cancel.clone(),
                Handle::current(),
            );
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .or_else(|| self.config.default_timeout());
            let session = Arc::new(ExecutionSession::new(
                id,
                context_id.clone(),
                timeout,
                cancel,
                sink,
                stream,
            ));
            state.sessions.insert(id, Arc::clone(&session));
            state.current.insert(context_id.clone(), id);
            session
        };

        let id = session.id();
        METRICS.inc_submitted();
        obs::emit_session_submitted(&id, &context_id, source_text.len());

        let ctx = WorkerContext {
            session_id: id,
            context_id,
            registry: Arc::clone(&self.registry),
            sink: session.sink(),
            cancel: session.cancel_token().clone(),
            limits: self.config.limits(),
        };
        let (started_tx, started_rx) = oneshot::channel();
        let worker = spawn_worker(
            Arc::clone(&session),
            Arc::clone(&self.runtime),
            source_text,
            ctx,
            started_tx,
        );
        tokio::spawn(supervise(session, worker));

        match started_rx.await {
            Ok(handle) => Ok(handle),
            Err(_) => {
                lock(&self.state).sessions.remove(&id);
                Err(EngineError::WorkerUnavailable(format!(
                    "session {id} ended before its worker started"
                )))
            }
        }
    }

    /// Request cooperative cancellation. Idempotent while the session is
    /// active; unknown and terminal sessions yield
    /// [`EngineError::UnknownSession`].
    pub fn cancel(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        if !session.request_cancel() {
            return Err(EngineError::UnknownSession(id));
        }
        obs::emit_cancel_requested(&id);
        Ok(())
    }

    pub fn query(&self, id: SessionId) -> Result<SessionSnapshot> {
        Ok(self.session(id)?.snapshot())
    }

    /// Take the session's output stream. Only one subscriber per session.
    pub fn subscribe(&self, id: SessionId) -> Result<OutputStream> {
        self.session(id)?
            .take_stream()
            .ok_or(EngineError::AlreadySubscribed(id))
    }

    /// Wait for the session's terminal result.
    pub async fn await_result(&self, id: SessionId) -> Result<ExecutionResult> {
        let session = self.session(id)?;
        session
            .wait_result()
            .await
            .ok_or(EngineError::ResultUnavailable(id))
    }

    /// Archive a terminated session and hand back its result.
    pub fn release(&self, id: SessionId) -> Result<ExecutionResult> {
        let mut state = lock(&self.state);
        let session = state
            .sessions
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownSession(id))?;
        let result = match session.result() {
            Some(result) => result,
            None if session.state().is_active() => return Err(EngineError::StillActive(id)),
            None => return Err(EngineError::ResultUnavailable(id)),
        };
        state.sessions.remove(&id);
        if state.current.get(session.context_id()) == Some(&id) {
            state.current.remove(session.context_id());
        }
        debug!(session_id = %id, "session released");
        Ok(result)
    }

    /// Number of sessions still tracked, active or not.
    pub fn tracked_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    fn session(&self, id: SessionId) -> Result<Arc<ExecutionSession>> {
        lock(&self.state)
            .sessions
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownSession(id))
    }
}

fn spawn_worker(
    session: Arc<ExecutionSession>,
    runtime: Arc<dyn ScriptRuntime>,
    source: String,
    ctx: WorkerContext,
    started: oneshot::Sender<SessionHandle>,
) -> JoinHandle<Termination> {
    tokio::task::spawn_blocking(move || {
        let _span = SessionSpan::enter(&ctx.session_id, &ctx.context_id);
        if let Some(handle) = session.mark_running() {
            obs::emit_session_started(runtime.name());
            // The submitter may have gone away; the session runs regardless.
            let _ = started.send(handle);
        }
        runtime.execute(&source, &ctx)
    })
}

/// Race the worker against the session's budget, then classify and finish.
async fn supervise(session: Arc<ExecutionSession>, mut worker: JoinHandle<Termination>) {
    let joined = match session.timeout() {
        None => worker.await,
        Some(budget) => {
            tokio::select! {
                joined = &mut worker => joined,
                _ = tokio::time::sleep(budget) => {
                    if session.cancel_token().expire() {
                        obs::emit_timed_out(&session.id(), budget.as_millis() as u64);
                    }
                    worker.await
                }
            }
        }
    };

    let termination = joined.unwrap_or_else(|e| Termination::Panicked(panic_message(e)));
    let classification = classify(termination, session.cancel_token().timed_out());
    if let Some(result) = session.finish(classification) {
        METRICS.record_terminal(result.state);
        obs::emit_session_finished(&result);
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "worker task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
