//! Translog: the ordered, durable log of shard operations
//!
//! Recovery replays a contiguous range of this log on the target. Each
//! operation carries its sequence number and primary term; the log is keyed
//! by sequence number and snapshots yield operations in increasing order.

mod errors;
mod log;
mod operation;

pub use errors::{TranslogError, TranslogResult};
pub use log::{Translog, TranslogSnapshot, TRANSLOG_FILE_NAME};
pub use operation::{OperationKind, TranslogOperation, MIN_OPERATION_BYTES};

/// Checkpoint of a copy that has processed no operations.
pub const NO_OPS_PERFORMED: i64 = -1;
