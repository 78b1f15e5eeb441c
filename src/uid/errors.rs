//! Identity resolution errors

use thiserror::Error;

use super::segment::{DocId, SegmentGeneration};
use crate::stream::CodecError;

/// Result type for resolver operations
pub type UidResult<T> = Result<T, UidError>;

/// Resolver and segment errors.
///
/// Everything except a decode failure points at a segment whose contents
/// contradict themselves. Those are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UidError {
    #[error(
        "segment {generation} has no identity index but is not a no-op segment; \
         soft_deletes present [{soft_deletes}], tombstone present [{tombstones}]"
    )]
    InconsistentSegment {
        generation: SegmentGeneration,
        soft_deletes: bool,
        tombstones: bool,
    },

    #[error("segment {generation} is missing the version column")]
    MissingVersionColumn { generation: SegmentGeneration },

    #[error("document [{doc}] in segment {generation} has no value for [{field}]")]
    MissingDocValue {
        generation: SegmentGeneration,
        doc: DocId,
        field: &'static str,
    },

    #[error("corrupt segment file: {0}")]
    Corrupt(String),

    #[error("segment decode failed: {0}")]
    Codec(#[from] CodecError),
}

impl UidError {
    /// Inconsistent segment state needs operator attention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UidError::InconsistentSegment { .. }
                | UidError::MissingVersionColumn { .. }
                | UidError::MissingDocValue { .. }
                | UidError::Corrupt(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistent_segment_is_fatal() {
        let err = UidError::InconsistentSegment {
            generation: SegmentGeneration(4),
            soft_deletes: false,
            tombstones: true,
        };
        assert!(err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("gen_4"));
        assert!(msg.contains("not a no-op segment"));
    }

    #[test]
    fn test_codec_error_is_not_fatal() {
        let err = UidError::from(CodecError::TrailingBytes(3));
        assert!(!err.is_fatal());
    }
}
