//! Ordered operation log with optional file backing
//!
//! On-disk record layout:
//! - Body length (u32 BE)
//! - Body (an encoded [`TranslogOperation`])
//! - Checksum (u32 BE, CRC32 of the body)
//!
//! A damaged or truncated record fails `open` outright. There is no partial
//! load and no repair.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::errors::{TranslogError, TranslogResult};
use super::operation::{TranslogOperation, MIN_OPERATION_BYTES};
use super::NO_OPS_PERFORMED;
use crate::store::checksum::compute_checksum;
use crate::stream::{StreamInput, StreamOutput};

/// File name of the translog inside a shard's `translog/` directory.
pub const TRANSLOG_FILE_NAME: &str = "ops.tlog";

const RECORD_OVERHEAD: usize = 4 + 4;

/// A shard's operation log, keyed by sequence number.
#[derive(Debug)]
pub struct Translog {
    ops: BTreeMap<i64, TranslogOperation>,
    file: Option<(PathBuf, File)>,
}

impl Translog {
    /// Log held only in memory.
    pub fn in_memory() -> Self {
        Self {
            ops: BTreeMap::new(),
            file: None,
        }
    }

    /// Open (creating if missing) the log at `<shard_dir>/translog/ops.tlog`.
    pub fn open_in_shard(shard_dir: &Path) -> TranslogResult<Self> {
        Self::open(&shard_dir.join("translog").join(TRANSLOG_FILE_NAME))
    }

    /// Open (creating if missing) a file-backed log and load every record.
    pub fn open(path: &Path) -> TranslogResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TranslogError::io(format!("create {}", parent.display()), e))?;
        }

        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(TranslogError::io(format!("read {}", path.display()), e)),
        };

        let mut ops = BTreeMap::new();
        for op in decode_records(&data)? {
            if ops.insert(op.seq_no, op.clone()).is_some() {
                return Err(TranslogError::DuplicateSeqNo { seq_no: op.seq_no });
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TranslogError::io(format!("open {}", path.display()), e))?;

        Ok(Self {
            ops,
            file: Some((path.to_path_buf(), file)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Highest recorded sequence number, or `NO_OPS_PERFORMED`.
    pub fn max_seq_no(&self) -> i64 {
        self.ops
            .keys()
            .next_back()
            .copied()
            .unwrap_or(NO_OPS_PERFORMED)
    }

    /// Record an operation. File-backed logs fsync before returning.
    ///
    /// Re-adding an identical operation is a no-op; a different operation
    /// under an existing sequence number is rejected.
    pub fn add(&mut self, op: TranslogOperation) -> TranslogResult<()> {
        if op.seq_no < 0 {
            return Err(TranslogError::InvalidSeqNo(op.seq_no));
        }
        if let Some(existing) = self.ops.get(&op.seq_no) {
            if *existing == op {
                return Ok(());
            }
            return Err(TranslogError::DuplicateSeqNo { seq_no: op.seq_no });
        }

        if let Some((path, file)) = self.file.as_mut() {
            let record = encode_record(&op);
            file.write_all(&record)
                .map_err(|e| TranslogError::io(format!("append {}", path.display()), e))?;
            file.sync_data()
                .map_err(|e| TranslogError::io(format!("fsync {}", path.display()), e))?;
        }
        self.ops.insert(op.seq_no, op);
        Ok(())
    }

    /// Operations with `from <= seq_no <= to`, in sequence order.
    pub fn snapshot(&self, from: i64, to: i64) -> TranslogSnapshot {
        let ops = if from > to {
            Vec::new()
        } else {
            self.ops.range(from..=to).map(|(_, op)| op.clone()).collect()
        };
        TranslogSnapshot::new(from, to, ops)
    }
}

fn encode_record(op: &TranslogOperation) -> Vec<u8> {
    let mut body = StreamOutput::with_capacity(op.estimated_size());
    op.write_to(&mut body);
    let body = body.into_bytes();

    let mut record = Vec::with_capacity(body.len() + RECORD_OVERHEAD);
    record.extend_from_slice(&(body.len() as u32).to_be_bytes());
    record.extend_from_slice(&body);
    record.extend_from_slice(&compute_checksum(&body).to_be_bytes());
    record
}

fn decode_records(data: &[u8]) -> TranslogResult<Vec<TranslogOperation>> {
    let mut ops = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < RECORD_OVERHEAD + MIN_OPERATION_BYTES {
            return Err(TranslogError::Corruption {
                offset: offset as u64,
                reason: format!("truncated record: {} bytes remaining", remaining),
            });
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[offset..offset + 4]);
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len + RECORD_OVERHEAD > remaining {
            return Err(TranslogError::Corruption {
                offset: offset as u64,
                reason: format!(
                    "record length {} exceeds remaining {} bytes",
                    body_len, remaining
                ),
            });
        }

        let body = &data[offset + 4..offset + 4 + body_len];
        let mut crc_buf = [0u8; 4];
        crc_buf.copy_from_slice(&data[offset + 4 + body_len..offset + 8 + body_len]);
        let expected = u32::from_be_bytes(crc_buf);
        let actual = compute_checksum(body);
        if expected != actual {
            return Err(TranslogError::Corruption {
                offset: offset as u64,
                reason: format!(
                    "checksum mismatch: expected {:08x}, actual {:08x}",
                    expected, actual
                ),
            });
        }

        let mut input = StreamInput::new(body);
        let op = TranslogOperation::read_from(&mut input)
            .and_then(|op| input.finish().map(|_| op))
            .map_err(|e| TranslogError::Corruption {
                offset: offset as u64,
                reason: e.to_string(),
            })?;
        ops.push(op);
        offset += body_len + RECORD_OVERHEAD;
    }
    Ok(ops)
}

/// Point-in-time copy of the operations in `[from, to]`.
///
/// Operations are yielded in the order they were captured. A snapshot built
/// from a [`Translog`] is always sorted; one built directly with
/// [`TranslogSnapshot::new`] is yielded as given.
#[derive(Debug, Clone)]
pub struct TranslogSnapshot {
    from_seq_no: i64,
    to_seq_no: i64,
    ops: std::vec::IntoIter<TranslogOperation>,
    total: usize,
}

impl TranslogSnapshot {
    pub fn new(from_seq_no: i64, to_seq_no: i64, ops: Vec<TranslogOperation>) -> Self {
        let total = ops.len();
        Self {
            from_seq_no,
            to_seq_no,
            ops: ops.into_iter(),
            total,
        }
    }

    pub fn from_seq_no(&self) -> i64 {
        self.from_seq_no
    }

    pub fn to_seq_no(&self) -> i64 {
        self.to_seq_no
    }

    /// Number of operations captured, regardless of how many were consumed.
    pub fn total_operations(&self) -> usize {
        self.total
    }
}

impl Iterator for TranslogSnapshot {
    type Item = TranslogOperation;

    fn next(&mut self) -> Option<Self::Item> {
        self.ops.next()
    }
}
