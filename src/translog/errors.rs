//! # Translog Errors

use thiserror::Error;

use crate::stream::CodecError;

/// Result type for translog operations
pub type TranslogResult<T> = Result<T, TranslogError>;

/// Translog errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslogError {
    #[error("Translog corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("Translog I/O error during {context}: {message}")]
    Io { context: String, message: String },

    #[error("Operation {seq_no} conflicts with an existing entry of the same sequence number")]
    DuplicateSeqNo { seq_no: i64 },

    #[error("Invalid sequence number {0}")]
    InvalidSeqNo(i64),

    #[error("Operation decode failed: {0}")]
    Codec(#[from] CodecError),
}

impl TranslogError {
    pub(crate) fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        TranslogError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Corruption of the durable log cannot be repaired by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TranslogError::Corruption { .. })
    }
}
