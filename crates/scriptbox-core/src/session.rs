//! Execution sessions: one submission's lifecycle from `Pending` to a
//! terminal state.
//!
//! A session is shared between the manager (which creates it and answers
//! queries), the supervisor task (which finishes it) and the worker thread
//! (which only marks it running and reads the cancellation token). Every
//! mutable field sits behind a short std mutex or an atomic, since the worker
//! is a blocking thread and never holds an async lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::classifier::Classification;
use crate::domain::{
    ContextId, ExecutionResult, SessionHandle, SessionId, SessionSnapshot, SessionState,
};
use crate::sink::{OutputSink, OutputStream};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Monotonic, shareable cancellation flag.
///
/// Once requested it stays requested. The worker polls [`is_requested`]
/// at its check points; async waiters use [`cancelled`].
///
/// [`is_requested`]: CancelToken::is_requested
/// [`cancelled`]: CancelToken::cancelled
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    requested: AtomicBool,
    timed_out: AtomicBool,
    signal: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                requested: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                signal,
            }),
        }
    }

    /// Request cancellation. Returns `true` only for the first request.
    pub fn request(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        if first {
            self.inner.signal.send_replace(true);
        }
        first
    }

    /// Cancel because the wall-clock budget ran out. A manual request that
    /// arrived earlier keeps precedence.
    pub fn expire(&self) -> bool {
        let first = self
            .inner
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.inner.timed_out.store(true, Ordering::SeqCst);
            self.inner.signal.send_replace(true);
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.signal.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
}

/// The mutable entity behind a session id.
#[derive(Debug)]
pub struct ExecutionSession {
    id: SessionId,
    context_id: ContextId,
    timeout: Option<Duration>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancelToken,
    sink: Arc<OutputSink>,
    stream: Mutex<Option<OutputStream>>,
    result: watch::Sender<Option<ExecutionResult>>,
}

impl ExecutionSession {
    pub fn new(
        id: SessionId,
        context_id: ContextId,
        timeout: Option<Duration>,
        cancel: CancelToken,
        sink: OutputSink,
        stream: OutputStream,
    ) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            id,
            context_id,
            timeout,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Pending,
                started_at: None,
                ended_at: None,
                started: None,
            }),
            cancel,
            sink: Arc::new(sink),
            stream: Mutex::new(Some(stream)),
            result,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn sink(&self) -> Arc<OutputSink> {
        Arc::clone(&self.sink)
    }

    pub fn state(&self) -> SessionState {
        lock(&self.lifecycle).state
    }

    /// `Pending -> Running`. Returns the handle on the first call only.
    pub fn mark_running(&self) -> Option<SessionHandle> {
        let mut lc = lock(&self.lifecycle);
        if lc.state != SessionState::Pending {
            return None;
        }
        let now = Utc::now();
        lc.state = SessionState::Running;
        lc.started_at = Some(now);
        lc.started = Some(Instant::now());
        Some(SessionHandle {
            id: self.id,
            context_id: self.context_id.clone(),
            started_at: now,
        })
    }

    /// Take the session to its terminal state.
    ///
    /// Closes the sink, then publishes the result. Only the first call has
    /// any effect; later calls return `None`.
    pub fn finish(&self, classification: Classification) -> Option<ExecutionResult> {
        let result = {
            let mut lc = lock(&self.lifecycle);
            if lc.state.is_terminal() {
                return None;
            }
            // Closed under the lifecycle lock: no snapshot may see a terminal
            // state with the sink still open.
            self.sink.close();
            let now = Utc::now();
            lc.state = classification.state;
            lc.ended_at = Some(now);
            if lc.started_at.is_none() {
                lc.started_at = Some(now);
            }
            let duration_ms = lc
                .started
                .map(|t| t.elapsed().as_millis().min(u128::from(u64::MAX)) as u64)
                .unwrap_or(0);
            ExecutionResult {
                session_id: self.id,
                context_id: self.context_id.clone(),
                state: classification.state,
                duration_ms,
                fault: classification.fault,
            }
        };

        self.result.send_replace(Some(result.clone()));
        Some(result)
    }

    /// Set the cancellation flag. Returns `false` if the session is already
    /// terminal.
    pub fn request_cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.cancel.request();
        true
    }

    /// Hand out the subscriber end of the sink, at most once.
    pub fn take_stream(&self) -> Option<OutputStream> {
        lock(&self.stream).take()
    }

    /// The result, if the session has terminated.
    pub fn result(&self) -> Option<ExecutionResult> {
        self.result.borrow().clone()
    }

    /// Wait for the terminal result.
    pub async fn wait_result(&self) -> Option<ExecutionResult> {
        let mut rx = self.result.subscribe();
        let result = rx.wait_for(|r| r.is_some()).await.ok()?;
        result.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let lc = lock(&self.lifecycle);
        SessionSnapshot {
            id: self.id,
            context_id: self.context_id.clone(),
            state: lc.state,
            started_at: lc.started_at,
            ended_at: lc.ended_at,
            cancel_requested: self.cancel.is_requested(),
            output_closed: self.sink.is_closed(),
        }
    }
}
