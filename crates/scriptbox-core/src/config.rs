//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, Result};
use crate::runtime::ExecutionLimits;

/// Configuration for the session manager and the script runtime.
///
/// Every field has a default, so a partial JSON file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunks buffered between a worker and its subscriber before the worker
    /// blocks.
    pub output_buffer_chunks: usize,
    /// VM instructions between cancellation checks.
    pub check_interval_instructions: u32,
    /// Interpreter heap limit. `None` means unlimited.
    pub memory_limit_bytes: Option<usize>,
    /// Cumulative output allowed per session. `None` means unlimited.
    pub max_output_bytes: Option<u64>,
    /// Wall-clock budget for submissions that do not carry their own.
    pub default_timeout_ms: Option<u64>,
    /// Name scripts are compiled under; appears in messages and traces.
    pub chunk_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_buffer_chunks: 256,
            check_interval_instructions: 1_000,
            memory_limit_bytes: Some(64 * 1024 * 1024),
            max_output_bytes: Some(4 * 1024 * 1024),
            default_timeout_ms: None,
            chunk_name: "script".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_buffer_chunks == 0 {
            return Err(EngineError::InvalidConfig(
                "output_buffer_chunks must be > 0".to_string(),
            ));
        }
        if self.check_interval_instructions == 0 {
            return Err(EngineError::InvalidConfig(
                "check_interval_instructions must be > 0".to_string(),
            ));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(EngineError::InvalidConfig(
                "default_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        if self.chunk_name.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "chunk_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            check_interval: self.check_interval_instructions,
            memory_limit_bytes: self.memory_limit_bytes,
            chunk_name: self.chunk_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.output_buffer_chunks, 256);
        assert_eq!(config.check_interval_instructions, 1_000);
        assert!(config.default_timeout().is_none());
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let config = EngineConfig {
            output_buffer_chunks: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_timeout_and_empty_chunk_name() {
        let zero_timeout = EngineConfig {
            default_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let blank = EngineConfig {
            chunk_name: "  ".to_string(),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_partial_json_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "default_timeout_ms": 1500, "max_output_bytes": null }}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.max_output_bytes, None);
        assert_eq!(config.output_buffer_chunks, 256);
    }

    #[test]
    fn test_invalid_json_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "check_interval_instructions": 0 }}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
