//! Global atomic counters for scriptbox sessions.
//!
//! Counters are incremented at the call site. Call [`Metrics::flush`] to emit
//! current values as a single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::SessionState;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free session counters.
pub struct Metrics {
    sessions_submitted: AtomicU64,
    sessions_rejected: AtomicU64,
    sessions_succeeded: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_cancelled: AtomicU64,
    sessions_timed_out: AtomicU64,
    capability_denials: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_submitted: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            sessions_succeeded: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            sessions_timed_out: AtomicU64::new(0),
            capability_denials: AtomicU64::new(0),
        }
    }

    pub fn inc_submitted(&self) {
        self.sessions_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_submitted", "counter incremented");
    }

    pub fn inc_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_rejected", "counter incremented");
    }

    pub fn inc_capability_denials(&self) {
        self.capability_denials.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "capability_denials", "counter incremented");
    }

    /// Count a session reaching `state`. Non-terminal states are ignored.
    pub fn record_terminal(&self, state: SessionState) {
        let counter = match state {
            SessionState::Succeeded => &self.sessions_succeeded,
            SessionState::Failed => &self.sessions_failed,
            SessionState::Cancelled => &self.sessions_cancelled,
            SessionState::TimedOut => &self.sessions_timed_out,
            SessionState::Pending | SessionState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_terminal", state = %state, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sessions_submitted = self.sessions_submitted(),
            sessions_rejected = self.sessions_rejected(),
            sessions_succeeded = self.sessions_succeeded(),
            sessions_failed = self.sessions_failed(),
            sessions_cancelled = self.sessions_cancelled(),
            sessions_timed_out = self.sessions_timed_out(),
            capability_denials = self.capability_denials(),
        );
    }

    pub fn sessions_submitted(&self) -> u64 {
        self.sessions_submitted.load(Ordering::Relaxed)
    }

    pub fn sessions_rejected(&self) -> u64 {
        self.sessions_rejected.load(Ordering::Relaxed)
    }

    pub fn sessions_succeeded(&self) -> u64 {
        self.sessions_succeeded.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn sessions_cancelled(&self) -> u64 {
        self.sessions_cancelled.load(Ordering::Relaxed)
    }

    pub fn sessions_timed_out(&self) -> u64 {
        self.sessions_timed_out.load(Ordering::Relaxed)
    }

    pub fn capability_denials(&self) -> u64 {
        self.capability_denials.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.sessions_submitted,
            &self.sessions_rejected,
            &self.sessions_succeeded,
            &self.sessions_failed,
            &self.sessions_cancelled,
            &self.sessions_timed_out,
            &self.capability_denials,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
