//! Session identity, lifecycle states and terminal results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::submission::ContextId;

/// Unique identifier for one execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an execution session.
///
/// `Pending -> Running -> {Succeeded | Failed | Cancelled | TimedOut}`,
/// each transition taken at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Classification of how a script run went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    SyntaxFault,
    NameFault,
    TypeFault,
    RuntimeFault,
    ResourceFault,
    /// Script tried to reach a symbol or module outside the registry.
    CapabilityFault,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SyntaxFault => "syntax_fault",
            Self::NameFault => "name_fault",
            Self::TypeFault => "type_fault",
            Self::RuntimeFault => "runtime_fault",
            Self::ResourceFault => "resource_fault",
            Self::CapabilityFault => "capability_fault",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// One frame of a fault trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    /// Function name, or `"main chunk"` / `"?"` when the runtime has none.
    pub symbol: String,
    pub source: Option<String>,
    pub line: Option<u32>,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.source, self.line) {
            (Some(src), Some(line)) => write!(f, "{}:{}: in {}", src, line, self.symbol),
            (Some(src), None) => write!(f, "{}: in {}", src, self.symbol),
            _ => write!(f, "in {}", self.symbol),
        }
    }
}

/// A classified fault. Frames are ordered innermost-last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<TraceFrame>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> Self {
        self.trace = trace;
        self
    }
}

/// Terminal report of one session. Exactly one exists per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: SessionId,
    pub context_id: ContextId,
    pub state: SessionState,
    pub duration_ms: u64,
    /// Present only when `state == Failed`.
    pub fault: Option<Fault>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.state == SessionState::Succeeded
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.fault.as_ref().map(|f| f.kind)
    }

    /// Kind describing how the run terminated, including the non-fault
    /// terminal states.
    pub fn termination_kind(&self) -> Option<FaultKind> {
        match self.state {
            SessionState::Cancelled => Some(FaultKind::Cancelled),
            SessionState::TimedOut => Some(FaultKind::TimedOut),
            _ => self.fault_kind(),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub context_id: ContextId,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub output_closed: bool,
}

/// Returned by a successful submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: SessionId,
    pub context_id: ContextId,
    pub started_at: DateTime<Utc>,
}
