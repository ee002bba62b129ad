//! Engine configuration
//!
//! Loaded from JSON or built from defaults. Every field has a default so a
//! partial file only overrides what it names.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default constants
pub mod defaults {
    pub const MAX_OPERATIONS_PER_COMMAND: u32 = 10_000;
    pub const CHECKPOINT_COMPRESSION_LEVEL: i32 = 3;
    pub const SKIP_EXPRESSIONS_VARIABLE: &str = "_SKIP_EXPRESSION_ENABLED";
}

/// Process engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Upper bound on agenda operations drained by one command
    pub max_operations_per_command: u32,
    /// Restore the pre-command checkpoint when a command fails
    pub rollback_on_error: bool,
    /// zstd level for checkpoints
    pub checkpoint_compression_level: i32,
    /// Process variable that switches sequence-flow skip expressions on
    pub skip_expressions_variable: String,
    /// Forward events to the history sink
    pub history_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations_per_command: defaults::MAX_OPERATIONS_PER_COMMAND,
            rollback_on_error: true,
            checkpoint_compression_level: defaults::CHECKPOINT_COMPRESSION_LEVEL,
            skip_expressions_variable: defaults::SKIP_EXPRESSIONS_VARIABLE.to_string(),
            history_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        log::debug!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    pub fn with_max_operations(mut self, max: u32) -> Self {
        self.max_operations_per_command = max;
        self
    }

    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.rollback_on_error = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"maxOperationsPerCommand": 50}"#).unwrap();
        assert_eq!(config.max_operations_per_command, 50);
        assert!(config.rollback_on_error);
        assert_eq!(config.skip_expressions_variable, "_SKIP_EXPRESSION_ENABLED");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"rollbackOnError": false, "historyEnabled": false}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert!(!config.rollback_on_error);
        assert!(!config.history_enabled);
        assert_eq!(config.checkpoint_compression_level, 3);
    }
}
