//! # Storage Engine Errors

use thiserror::Error;

use crate::uid::{SegmentGeneration, UidError};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Storage engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Engine is not prepared for operations")]
    NotPrepared,

    #[error("Invalid operation {seq_no}: {reason}")]
    InvalidOperation { seq_no: i64, reason: String },

    #[error("No segment generation left after {last}")]
    GenerationsExhausted { last: SegmentGeneration },

    #[error("Identity resolution failed: {0}")]
    Uid(#[from] UidError),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Uid(e) => e.is_fatal(),
            _ => false,
        }
    }
}
