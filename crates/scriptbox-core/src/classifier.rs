//! Result classifier: maps how a worker ended into a terminal state and,
//! for failures, a classified [`Fault`].

use crate::domain::{Fault, FaultKind, SessionState, TraceFrame};

/// How a worker's run ended, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The script ran to completion.
    Returned,
    /// The script raised a fault not caused by cancellation.
    Raised(Fault),
    /// The script stopped at a check point after cancellation was requested.
    Interrupted,
    /// The worker thread panicked.
    Panicked(String),
}

/// Terminal state plus the fault that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: SessionState,
    pub fault: Option<Fault>,
}

/// Classify a termination. `timed_out` tells whether the cancellation that
/// interrupted the worker came from the wall-clock budget.
pub fn classify(termination: Termination, timed_out: bool) -> Classification {
    match termination {
        Termination::Returned => Classification {
            state: SessionState::Succeeded,
            fault: None,
        },
        Termination::Interrupted => Classification {
            state: if timed_out {
                SessionState::TimedOut
            } else {
                SessionState::Cancelled
            },
            fault: None,
        },
        Termination::Raised(fault) => Classification {
            state: SessionState::Failed,
            fault: Some(fault),
        },
        Termination::Panicked(msg) => Classification {
            state: SessionState::Failed,
            fault: Some(Fault::new(
                FaultKind::RuntimeFault,
                format!("worker panicked: {msg}"),
            )),
        },
    }
}

/// Aborts raised by engine-provided functions and the environment guard.
///
/// Carried through the interpreter as `mlua::Error::external(..)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptAbort {
    #[error("capability denied: '{name}' ({reason})")]
    CapabilityDenied { name: String, reason: String },

    #[error("undefined name '{0}'")]
    UndefinedName(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("output limit of {limit} bytes exceeded")]
    OutputLimit { limit: u64 },

    #[error("execution interrupted")]
    Interrupted,
}

impl ScriptAbort {
    pub fn into_lua(self) -> mlua::Error {
        mlua::Error::external(self)
    }

    fn kind(&self) -> FaultKind {
        match self {
            Self::CapabilityDenied { .. } => FaultKind::CapabilityFault,
            Self::UndefinedName(_) => FaultKind::NameFault,
            Self::TypeMismatch(_) => FaultKind::TypeFault,
            Self::OutputLimit { .. } => FaultKind::ResourceFault,
            Self::Interrupted => FaultKind::Cancelled,
        }
    }
}

fn cause(err: &mlua::Error) -> Option<&mlua::Error> {
    match err {
        mlua::Error::CallbackError { cause, .. } => Some(cause.as_ref()),
        mlua::Error::WithContext { cause, .. } => Some(cause.as_ref()),
        mlua::Error::BadArgument { cause, .. } => Some(cause.as_ref()),
        _ => None,
    }
}

/// Innermost error of a callback/context chain.
fn root(mut err: &mlua::Error) -> &mlua::Error {
    while let Some(next) = cause(err) {
        err = next;
    }
    err
}

fn has_bad_argument(mut err: &mlua::Error) -> bool {
    loop {
        if matches!(err, mlua::Error::BadArgument { .. }) {
            return true;
        }
        match cause(err) {
            Some(next) => err = next,
            None => return false,
        }
    }
}

/// Find a [`ScriptAbort`] anywhere in the error's cause chain.
pub fn find_abort(err: &mlua::Error) -> Option<&ScriptAbort> {
    match root(err) {
        mlua::Error::ExternalError(ext) => ext.downcast_ref::<ScriptAbort>(),
        _ => None,
    }
}

/// Errors that `pcall` must re-raise instead of catching.
pub fn is_uncatchable(err: &mlua::Error) -> bool {
    match find_abort(err) {
        Some(ScriptAbort::Interrupted)
        | Some(ScriptAbort::OutputLimit { .. })
        | Some(ScriptAbort::CapabilityDenied { .. }) => true,
        Some(_) => false,
        None => matches!(root(err), mlua::Error::MemoryError(_)),
    }
}

/// Human-readable message without mlua's wrapping and tracebacks.
pub fn error_message(err: &mlua::Error) -> String {
    match root(err) {
        mlua::Error::RuntimeError(msg) => strip_traceback(msg).to_string(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::MemoryError(_) => "not enough memory".to_string(),
        mlua::Error::ExternalError(ext) => ext.to_string(),
        other => other.to_string(),
    }
}

fn strip_traceback(msg: &str) -> &str {
    match msg.find("\nstack traceback:") {
        Some(pos) => &msg[..pos],
        None => msg,
    }
}

/// Classify a message produced by the interpreter itself.
pub fn kind_from_message(msg: &str) -> FaultKind {
    const TYPE_MARKERS: &[&str] = &[
        "attempt to perform arithmetic",
        "attempt to concatenate",
        "attempt to compare",
        "attempt to index",
        "attempt to call",
        "attempt to get length",
        "bad argument",
        "number has no integer representation",
    ];
    // The message handler only fails when the stack is already exhausted.
    const RESOURCE_MARKERS: &[&str] = &[
        "stack overflow",
        "not enough memory",
        "error in error handling",
    ];

    if TYPE_MARKERS.iter().any(|m| msg.contains(m)) {
        FaultKind::TypeFault
    } else if RESOURCE_MARKERS.iter().any(|m| msg.contains(m)) {
        FaultKind::ResourceFault
    } else {
        FaultKind::RuntimeFault
    }
}

/// Line number from a `"<chunk>:<line>: ..."` message prefix.
pub fn line_from_message(msg: &str, chunk_name: &str) -> Option<u32> {
    let rest = msg.strip_prefix(chunk_name)?.strip_prefix(':')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn fallback_trace(msg: &str, chunk_name: &str) -> Vec<TraceFrame> {
    line_from_message(msg, chunk_name)
        .map(|line| {
            vec![TraceFrame {
                symbol: "main chunk".to_string(),
                source: Some(chunk_name.to_string()),
                line: Some(line),
            }]
        })
        .unwrap_or_default()
}

/// Build a fault from an interpreter error.
///
/// `trace` is what the runtime captured at the raise site (innermost-last).
/// When it is empty, a single frame is recovered from the message position.
pub fn fault_from_error(err: &mlua::Error, trace: Vec<TraceFrame>, chunk_name: &str) -> Fault {
    let message = error_message(err);
    let kind = if let Some(abort) = find_abort(err) {
        abort.kind()
    } else {
        match root(err) {
            mlua::Error::SyntaxError { .. } => FaultKind::SyntaxFault,
            mlua::Error::MemoryError(_) => FaultKind::ResourceFault,
            mlua::Error::FromLuaConversionError { .. }
            | mlua::Error::ToLuaConversionError { .. } => FaultKind::TypeFault,
            _ if has_bad_argument(err) => FaultKind::TypeFault,
            _ => kind_from_message(&message),
        }
    };
    let trace = if trace.is_empty() {
        fallback_trace(&message, chunk_name)
    } else {
        trace
    };
    Fault {
        kind,
        message,
        trace,
    }
}

/// Termination for an error that escaped the script.
pub fn termination_from_error(
    err: &mlua::Error,
    trace: Vec<TraceFrame>,
    chunk_name: &str,
) -> Termination {
    if matches!(find_abort(err), Some(ScriptAbort::Interrupted)) {
        return Termination::Interrupted;
    }
    Termination::Raised(fault_from_error(err, trace, chunk_name))
}

/// Termination for a plain (non-error-object) value raised by `error(..)`
/// or by the interpreter.
pub fn termination_from_message(
    msg: String,
    trace: Vec<TraceFrame>,
    chunk_name: &str,
) -> Termination {
    let trace = if trace.is_empty() {
        fallback_trace(&msg, chunk_name)
    } else {
        trace
    };
    Termination::Raised(Fault {
        kind: kind_from_message(&msg),
        message: msg,
        trace,
    })
}
