//! Scriptbox Core Library
//!
//! Sandboxed script execution: a capability registry, per-session output
//! sinks, the session manager and the result classifier.

pub mod capability;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod manager;
pub mod metrics;
pub mod obs;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod telemetry;

pub use capability::{
    Builtin, Capability, CapabilityManifest, CapabilityRegistry, ModuleFacade, ModuleSource,
    Native,
};

pub use classifier::{classify, Classification, ScriptAbort, Termination};

pub use config::EngineConfig;

pub use domain::{
    ContextId, EngineError, ExecutionResult, Fault, FaultKind, Result, ScriptSubmission,
    SessionHandle, SessionId, SessionSnapshot, SessionState, TraceFrame,
};

pub use manager::SessionManager;

pub use runtime::{ExecutionLimits, LuaRuntime, ScriptRuntime, WorkerContext};

pub use session::{CancelToken, ExecutionSession};

pub use sink::{OutputChunk, OutputSink, OutputStream, SinkError, StreamKind};

pub use metrics::METRICS;
pub use obs::SessionSpan;
pub use telemetry::init_tracing;

/// Scriptbox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
