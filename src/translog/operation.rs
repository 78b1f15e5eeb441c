//! Translog operation types and their binary encoding
//!
//! Body layout (shared by the on-disk log and recovery batches):
//! - Sequence number (i64 BE)
//! - Primary term (i64 BE)
//! - Kind tag (u8): 0 = index, 1 = delete, 2 = no-op
//! - Index: id (string), version (i64), source (bytes)
//! - Delete: id (string), version (i64)
//! - No-op: reason (string)

use serde::{Deserialize, Serialize};

use crate::stream::{CodecError, CodecResult, StreamInput, StreamOutput};

/// Smallest possible encoded operation: two i64s, a tag and an empty string.
pub const MIN_OPERATION_BYTES: usize = 8 + 8 + 1 + 1;

/// What an operation does to the shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Index {
        id: String,
        version: i64,
        source: Vec<u8>,
    },
    Delete {
        id: String,
        version: i64,
    },
    NoOp {
        reason: String,
    },
}

impl OperationKind {
    fn tag(&self) -> u8 {
        match self {
            OperationKind::Index { .. } => 0,
            OperationKind::Delete { .. } => 1,
            OperationKind::NoOp { .. } => 2,
        }
    }
}

/// One entry of the ordered operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslogOperation {
    pub seq_no: i64,
    pub primary_term: i64,
    pub kind: OperationKind,
}

impl TranslogOperation {
    pub fn index(
        seq_no: i64,
        primary_term: i64,
        id: impl Into<String>,
        version: i64,
        source: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            seq_no,
            primary_term,
            kind: OperationKind::Index {
                id: id.into(),
                version,
                source: source.into(),
            },
        }
    }

    pub fn delete(seq_no: i64, primary_term: i64, id: impl Into<String>, version: i64) -> Self {
        Self {
            seq_no,
            primary_term,
            kind: OperationKind::Delete {
                id: id.into(),
                version,
            },
        }
    }

    pub fn no_op(seq_no: i64, primary_term: i64, reason: impl Into<String>) -> Self {
        Self {
            seq_no,
            primary_term,
            kind: OperationKind::NoOp {
                reason: reason.into(),
            },
        }
    }

    /// Document id, absent for no-ops.
    pub fn id(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::Index { id, .. } | OperationKind::Delete { id, .. } => Some(id),
            OperationKind::NoOp { .. } => None,
        }
    }

    /// Upper bound on the encoded size, used for batch sizing.
    pub fn estimated_size(&self) -> usize {
        let body = match &self.kind {
            OperationKind::Index { id, source, .. } => 5 + id.len() + 8 + 5 + source.len(),
            OperationKind::Delete { id, .. } => 5 + id.len() + 8,
            OperationKind::NoOp { reason } => 5 + reason.len(),
        };
        8 + 8 + 1 + body
    }

    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.seq_no);
        out.write_i64(self.primary_term);
        out.write_u8(self.kind.tag());
        match &self.kind {
            OperationKind::Index {
                id,
                version,
                source,
            } => {
                out.write_string(id);
                out.write_i64(*version);
                out.write_bytes(source);
            }
            OperationKind::Delete { id, version } => {
                out.write_string(id);
                out.write_i64(*version);
            }
            OperationKind::NoOp { reason } => {
                out.write_string(reason);
            }
        }
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        let seq_no = input.read_i64()?;
        let primary_term = input.read_i64()?;
        let kind = match input.read_u8()? {
            0 => OperationKind::Index {
                id: input.read_string()?,
                version: input.read_i64()?,
                source: input.read_bytes()?,
            },
            1 => OperationKind::Delete {
                id: input.read_string()?,
                version: input.read_i64()?,
            },
            2 => OperationKind::NoOp {
                reason: input.read_string()?,
            },
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "translog operation",
                    tag,
                })
            }
        };
        Ok(Self {
            seq_no,
            primary_term,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_kind_decodes_back() {
        let ops = vec![
            TranslogOperation::index(0, 1, "doc-1", 3, b"{\"f\":1}".to_vec()),
            TranslogOperation::delete(1, 1, "doc-1", 4),
            TranslogOperation::no_op(2, 2, "primary promotion"),
        ];
        let mut out = StreamOutput::new();
        for op in &ops {
            op.write_to(&mut out);
        }
        let mut input = StreamInput::new(out.as_bytes());
        for op in &ops {
            assert_eq!(&TranslogOperation::read_from(&mut input).unwrap(), op);
        }
        input.finish().unwrap();
    }

    #[test]
    fn test_unknown_kind_tag() {
        let mut out = StreamOutput::new();
        out.write_i64(0);
        out.write_i64(1);
        out.write_u8(9);
        let mut input = StreamInput::new(out.as_bytes());
        assert_eq!(
            TranslogOperation::read_from(&mut input),
            Err(CodecError::UnknownTag {
                what: "translog operation",
                tag: 9
            })
        );
    }

    #[test]
    fn test_estimated_size_covers_encoding() {
        let op = TranslogOperation::index(7, 1, "id", 1, vec![0u8; 300]);
        let mut out = StreamOutput::new();
        op.write_to(&mut out);
        assert!(op.estimated_size() >= out.len());
        assert!(out.len() >= MIN_OPERATION_BYTES);
    }

    #[test]
    fn test_noop_has_no_id() {
        assert_eq!(TranslogOperation::no_op(0, 1, "gap").id(), None);
        assert_eq!(TranslogOperation::delete(0, 1, "x", 1).id(), Some("x"));
    }
}
