//! Storage engine seam
//!
//! The recovery target hands the segments it received to an engine and then
//! replays operations through it. The engine owns the shard's searchable
//! segment list; the target only reads that list to resolve document ids.

mod errors;
mod memory;

use std::sync::Arc;

pub use errors::{EngineError, EngineResult};
pub use memory::InMemoryEngine;

use crate::translog::TranslogOperation;
use crate::uid::Segment;

/// Applies replayed operations on a recovering shard.
pub trait StorageEngine: Send {
    /// Reset to exactly `segments` (oldest first) before replay starts.
    fn prepare_for_operations(&mut self, segments: Vec<Arc<Segment>>) -> EngineResult<()>;

    /// Apply one operation and return its sequence number as recorded.
    fn apply_operation(&mut self, op: &TranslogOperation) -> EngineResult<i64>;

    /// Make applied operations visible to [`StorageEngine::searcher`].
    fn refresh(&mut self) -> EngineResult<()>;

    /// Current searchable segments, oldest first.
    fn searcher(&self) -> Vec<Arc<Segment>>;

    /// Highest sequence number below which every operation is processed.
    fn local_checkpoint(&self) -> i64;

    /// Highest sequence number processed, contiguous or not.
    fn max_seq_no(&self) -> i64;

    /// Whether `seq_no` is already reflected in this engine, either in the
    /// prepared segments (live, deleted or tombstone positions alike) or
    /// through a replayed operation.
    fn has_processed(&self, seq_no: i64) -> bool;
}
