//! Recovery settings
//!
//! Settings are an explicit value handed to the recovery manager; nothing
//! reads them from global state. A JSON file may set any subset of fields,
//! the rest take their defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("Invalid setting [{field}]: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read settings file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse settings file {path}: {message}")]
    Parse { path: String, message: String },
}

fn default_max_concurrent_recoveries() -> usize {
    2
}

fn default_chunk_size_bytes() -> usize {
    512 * 1024
}

fn default_max_concurrent_file_chunks() -> usize {
    2
}

fn default_ops_batch_size() -> usize {
    1000
}

fn default_ops_batch_bytes() -> usize {
    512 * 1024
}

fn default_internal_action_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_internal_action_long_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_cancel_grace_ms() -> u64 {
    30 * 1000
}

/// Tunables for peer recovery on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoverySettings {
    /// Sessions allowed to run at once; the rest wait in INIT.
    #[serde(default = "default_max_concurrent_recoveries")]
    pub max_concurrent_recoveries: usize,

    /// Largest file chunk sent in one request.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,

    /// Chunks allowed in flight without an acknowledgment.
    #[serde(default = "default_max_concurrent_file_chunks")]
    pub max_concurrent_file_chunks: usize,

    /// Most operations in one batch.
    #[serde(default = "default_ops_batch_size")]
    pub ops_batch_size: usize,

    /// Most encoded operation bytes in one batch. A single larger operation
    /// is still sent, alone.
    #[serde(default = "default_ops_batch_bytes")]
    pub ops_batch_bytes: usize,

    /// Per-request timeout.
    #[serde(default = "default_internal_action_timeout_ms")]
    pub internal_action_timeout_ms: u64,

    /// Per-request timeout for finalize.
    #[serde(default = "default_internal_action_long_timeout_ms")]
    pub internal_action_long_timeout_ms: u64,

    /// Upper bound on delivering a cancel request.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: default_max_concurrent_recoveries(),
            chunk_size_bytes: default_chunk_size_bytes(),
            max_concurrent_file_chunks: default_max_concurrent_file_chunks(),
            ops_batch_size: default_ops_batch_size(),
            ops_batch_bytes: default_ops_batch_bytes(),
            internal_action_timeout_ms: default_internal_action_timeout_ms(),
            internal_action_long_timeout_ms: default_internal_action_long_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl RecoverySettings {
    /// Load and validate settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let settings: RecoverySettings =
            serde_json::from_str(&raw).map_err(|e| SettingsError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Every count and size must be positive; the long timeout must not be
    /// shorter than the regular one.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = [
            ("max_concurrent_recoveries", self.max_concurrent_recoveries as u64),
            ("chunk_size_bytes", self.chunk_size_bytes as u64),
            ("max_concurrent_file_chunks", self.max_concurrent_file_chunks as u64),
            ("ops_batch_size", self.ops_batch_size as u64),
            ("ops_batch_bytes", self.ops_batch_bytes as u64),
            ("internal_action_timeout_ms", self.internal_action_timeout_ms),
            ("internal_action_long_timeout_ms", self.internal_action_long_timeout_ms),
            ("cancel_grace_ms", self.cancel_grace_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(SettingsError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.chunk_size_bytes > i32::MAX as usize {
            return Err(SettingsError::Invalid {
                field: "chunk_size_bytes",
                reason: format!("must not exceed {}", i32::MAX),
            });
        }
        if self.internal_action_long_timeout_ms < self.internal_action_timeout_ms {
            return Err(SettingsError::Invalid {
                field: "internal_action_long_timeout_ms",
                reason: "must not be shorter than internal_action_timeout_ms".into(),
            });
        }
        Ok(())
    }

    pub fn internal_action_timeout(&self) -> Duration {
        Duration::from_millis(self.internal_action_timeout_ms)
    }

    pub fn internal_action_long_timeout(&self) -> Duration {
        Duration::from_millis(self.internal_action_long_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
