//! # Shard Store Errors

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shard store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("File {0} is referenced by a pinned snapshot")]
    Pinned(String),

    #[error("Read past end of {name}: position {position} + {len} > length {length}")]
    OutOfRange {
        name: String,
        position: u64,
        len: u64,
        length: u64,
    },

    #[error("Checksum mismatch for {name}: expected {expected:08x}, actual {actual:08x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("I/O error during {context}: {message}")]
    Io { context: String, message: String },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return StoreError::NotFound(context.into());
        }
        StoreError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }
}
