//! Script submissions and the editor contexts they come from.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a logical editor/console pairing.
///
/// At most one session may be active per context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One script handed to the engine by a collaborator.
///
/// Consumed by value when a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSubmission {
    /// Context the script was submitted from.
    pub context_id: ContextId,

    /// The script body.
    pub source_text: String,

    /// When the collaborator submitted the script.
    pub submitted_at: DateTime<Utc>,

    /// Wall-clock budget in milliseconds. `None` defers to the engine default.
    pub timeout_ms: Option<u64>,
}

impl ScriptSubmission {
    pub fn new(context_id: impl Into<ContextId>, source_text: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            source_text: source_text.into(),
            submitted_at: Utc::now(),
            timeout_ms: None,
        }
    }

    /// Attach a wall-clock budget to this submission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_defaults_to_no_timeout() {
        let sub = ScriptSubmission::new("A", "print(1)");
        assert_eq!(sub.context_id.as_str(), "A");
        assert_eq!(sub.source_text, "print(1)");
        assert!(sub.timeout().is_none());
    }

    #[test]
    fn test_with_timeout() {
        let sub = ScriptSubmission::new("A", "").with_timeout(Duration::from_millis(250));
        assert_eq!(sub.timeout_ms, Some(250));
        assert_eq!(sub.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_context_id_serializes_transparently() {
        let id = ContextId::new("editor-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"editor-7\"");
    }
}
