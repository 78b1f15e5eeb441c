//! In-memory reference engine
//!
//! Keeps sealed segments plus one pending builder. Applying an operation
//! soft-deletes the previous live copy of the document (in the pending
//! builder, or by replacing the sealed segment with a new generation) and
//! appends the new copy to the pending builder. `refresh` seals the pending
//! builder into a new segment.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::errors::{EngineError, EngineResult};
use super::StorageEngine;
use crate::translog::{OperationKind, TranslogOperation, NO_OPS_PERFORMED};
use crate::uid::{
    DocIdAndVersion, IdResolver, Segment, SegmentBuilder, SegmentGeneration, SegmentIdLookup,
};

/// Tracks which sequence numbers were processed and the contiguous prefix.
#[derive(Debug, Clone)]
struct LocalCheckpointTracker {
    checkpoint: i64,
    max_seq_no: i64,
    pending: BTreeSet<i64>,
}

impl LocalCheckpointTracker {
    fn new() -> Self {
        Self {
            checkpoint: NO_OPS_PERFORMED,
            max_seq_no: NO_OPS_PERFORMED,
            pending: BTreeSet::new(),
        }
    }

    fn mark_processed(&mut self, seq_no: i64) {
        self.max_seq_no = self.max_seq_no.max(seq_no);
        if seq_no <= self.checkpoint {
            return;
        }
        self.pending.insert(seq_no);
        while self.pending.remove(&(self.checkpoint + 1)) {
            self.checkpoint += 1;
        }
    }

    fn contains(&self, seq_no: i64) -> bool {
        seq_no <= self.checkpoint || self.pending.contains(&seq_no)
    }
}

/// Segment-maintaining engine held entirely in memory.
#[derive(Debug)]
pub struct InMemoryEngine {
    segments: Vec<Arc<Segment>>,
    pending: SegmentBuilder,
    resolver: IdResolver,
    tracker: LocalCheckpointTracker,
    next_generation: u64,
    sources: HashMap<String, Vec<u8>>,
    prepared: bool,
}

impl InMemoryEngine {
    /// An engine that rejects operations until prepared.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            pending: SegmentBuilder::new(),
            resolver: IdResolver::new(),
            tracker: LocalCheckpointTracker::new(),
            next_generation: 1,
            sources: HashMap::new(),
            prepared: false,
        }
    }

    /// An engine prepared with `segments`.
    pub fn with_segments(segments: Vec<Arc<Segment>>) -> EngineResult<Self> {
        let mut engine = Self::new();
        engine.prepare_for_operations(segments)?;
        Ok(engine)
    }

    fn allocate_generation(&mut self) -> EngineResult<SegmentGeneration> {
        let generation = SegmentGeneration(self.next_generation);
        self.next_generation = self
            .next_generation
            .checked_add(1)
            .ok_or(EngineError::GenerationsExhausted { last: generation })?;
        Ok(generation)
    }

    /// Soft-delete the current live copy of `id`, wherever it is.
    fn remove_live(&mut self, id: &str) -> EngineResult<()> {
        if let Some(doc) = self.pending.find_live(id.as_bytes()) {
            self.pending.soft_delete(doc);
            return Ok(());
        }
        let found = self
            .resolver
            .load_doc_id_and_version(&self.segments, id.as_bytes(), false)?;
        if let Some(found) = found {
            let generation = self.allocate_generation()?;
            if let Some(slot) = self
                .segments
                .iter_mut()
                .find(|segment| segment.generation() == found.generation)
            {
                *slot = Arc::new(slot.with_soft_deleted(found.doc_id, generation));
            }
        }
        Ok(())
    }

    /// Resolve `id` against the searchable segments, seq_no included.
    pub fn get(&mut self, id: &str) -> EngineResult<Option<DocIdAndVersion>> {
        Ok(self
            .resolver
            .load_doc_id_and_version(&self.segments, id.as_bytes(), true)?)
    }

    /// Source of a document applied through this engine.
    pub fn source(&self, id: &str) -> Option<&[u8]> {
        self.sources.get(id).map(|s| s.as_slice())
    }

    /// Live documents across the searchable segments.
    pub fn num_docs(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.num_docs())).sum()
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for InMemoryEngine {
    fn prepare_for_operations(&mut self, segments: Vec<Arc<Segment>>) -> EngineResult<()> {
        let mut tracker = LocalCheckpointTracker::new();
        let mut next_generation = self.next_generation;
        for segment in &segments {
            SegmentIdLookup::new(Arc::clone(segment))?;
            let after = segment
                .generation()
                .0
                .checked_add(1)
                .ok_or(EngineError::GenerationsExhausted {
                    last: segment.generation(),
                })?;
            next_generation = next_generation.max(after);
            if let Some(seq_nos) = segment.seq_nos() {
                for doc in 0..segment.max_doc() {
                    if let Some(seq_no) = seq_nos.get(doc) {
                        tracker.mark_processed(seq_no);
                    }
                }
            }
        }

        self.segments = segments;
        self.pending = SegmentBuilder::new();
        self.resolver = IdResolver::new();
        self.tracker = tracker;
        self.next_generation = next_generation;
        self.sources.clear();
        self.prepared = true;
        Ok(())
    }

    fn apply_operation(&mut self, op: &TranslogOperation) -> EngineResult<i64> {
        if !self.prepared {
            return Err(EngineError::NotPrepared);
        }
        if op.seq_no < 0 {
            return Err(EngineError::InvalidOperation {
                seq_no: op.seq_no,
                reason: "sequence number must not be negative".into(),
            });
        }

        match &op.kind {
            OperationKind::Index {
                id,
                version,
                source,
            } => {
                self.remove_live(id)?;
                self.pending
                    .add_document(id.as_bytes(), *version, op.seq_no, op.primary_term);
                self.sources.insert(id.clone(), source.clone());
            }
            OperationKind::Delete { id, version } => {
                self.remove_live(id)?;
                self.pending
                    .add_delete_tombstone(id.as_bytes(), *version, op.seq_no, op.primary_term);
                self.sources.remove(id);
            }
            OperationKind::NoOp { .. } => {
                self.pending.add_noop_tombstone(op.seq_no, op.primary_term);
            }
        }

        self.tracker.mark_processed(op.seq_no);
        Ok(op.seq_no)
    }

    fn refresh(&mut self) -> EngineResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let generation = self.allocate_generation()?;
        let segment = self.pending.build(generation);
        self.segments.push(Arc::new(segment));
        self.pending = SegmentBuilder::new();
        Ok(())
    }

    fn searcher(&self) -> Vec<Arc<Segment>> {
        self.segments.clone()
    }

    fn local_checkpoint(&self) -> i64 {
        self.tracker.checkpoint
    }

    fn max_seq_no(&self) -> i64 {
        self.tracker.max_seq_no
    }

    fn has_processed(&self, seq_no: i64) -> bool {
        seq_no >= 0 && self.tracker.contains(seq_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::UidError;

    fn index(seq_no: i64, id: &str, version: i64) -> TranslogOperation {
        TranslogOperation::index(seq_no, 1, id, version, format!("{{\"v\":{}}}", version))
    }

    #[test]
    fn test_rejects_operations_before_prepare() {
        let mut engine = InMemoryEngine::new();
        assert_eq!(
            engine.apply_operation(&index(0, "a", 1)),
            Err(EngineError::NotPrepared)
        );
    }

    #[test]
    fn test_updates_replace_previous_copy() {
        let mut engine = InMemoryEngine::with_segments(Vec::new()).unwrap();
        engine.apply_operation(&index(0, "a", 1)).unwrap();
        engine.apply_operation(&index(1, "a", 2)).unwrap();
        engine.refresh().unwrap();

        let found = engine.get("a").unwrap().unwrap();
        assert_eq!(found.version, 2);
        assert_eq!(found.seq_no, Some(1));
        assert_eq!(engine.num_docs(), 1);
        assert_eq!(engine.source("a"), Some(&b"{\"v\":2}"[..]));
    }

    #[test]
    fn test_update_of_sealed_document_creates_new_generation() {
        let mut builder = SegmentBuilder::new();
        builder.add_document(b"a".to_vec(), 1, 0, 1);
        let sealed = Arc::new(builder.build(SegmentGeneration(4)));

        let mut engine = InMemoryEngine::with_segments(vec![sealed]).unwrap();
        assert_eq!(engine.local_checkpoint(), 0);

        engine.apply_operation(&index(1, "a", 2)).unwrap();
        engine.refresh().unwrap();

        let segments = engine.searcher();
        assert_eq!(segments.len(), 2);
        assert_ne!(segments[0].generation(), SegmentGeneration(4));
        assert!(!segments[0].is_live(0));
        assert_eq!(engine.get("a").unwrap().unwrap().version, 2);
        assert_eq!(engine.num_docs(), 1);
    }

    #[test]
    fn test_delete_leaves_tombstone_and_hides_document() {
        let mut engine = InMemoryEngine::with_segments(Vec::new()).unwrap();
        engine.apply_operation(&index(0, "a", 1)).unwrap();
        engine
            .apply_operation(&TranslogOperation::delete(1, 1, "a", 2))
            .unwrap();
        engine
            .apply_operation(&TranslogOperation::no_op(2, 1, "fill"))
            .unwrap();
        engine.refresh().unwrap();

        assert_eq!(engine.get("a").unwrap(), None);
        assert_eq!(engine.num_docs(), 0);
        assert_eq!(engine.local_checkpoint(), 2);
        assert_eq!(engine.source("a"), None);
    }

    #[test]
    fn test_checkpoint_waits_for_gaps() {
        let mut engine = InMemoryEngine::with_segments(Vec::new()).unwrap();
        engine.apply_operation(&index(0, "a", 1)).unwrap();
        engine.apply_operation(&index(2, "b", 1)).unwrap();
        assert_eq!(engine.local_checkpoint(), 0);
        assert_eq!(engine.max_seq_no(), 2);
        engine.apply_operation(&index(1, "c", 1)).unwrap();
        assert_eq!(engine.local_checkpoint(), 2);
    }

    #[test]
    fn test_processed_includes_deleted_and_tombstone_positions() {
        let mut builder = SegmentBuilder::new();
        let doc = builder.add_document(b"a".to_vec(), 1, 0, 1);
        builder.soft_delete(doc);
        builder.add_delete_tombstone(b"a".to_vec(), 2, 1, 1);
        builder.add_noop_tombstone(3, 1);
        let sealed = Arc::new(builder.build(SegmentGeneration(1)));

        let engine = InMemoryEngine::with_segments(vec![sealed]).unwrap();
        assert!(engine.has_processed(0));
        assert!(engine.has_processed(1));
        assert!(!engine.has_processed(2));
        assert!(engine.has_processed(3));
        assert!(!engine.has_processed(-1));
        assert_eq!(engine.local_checkpoint(), 1);
    }

    #[test]
    fn test_last_generation_is_rejected() {
        let mut builder = SegmentBuilder::new();
        builder.add_document(b"a".to_vec(), 1, 0, 1);
        let last = Arc::new(builder.build(SegmentGeneration(u64::MAX)));

        let err = InMemoryEngine::with_segments(vec![last]).unwrap_err();
        assert!(matches!(err, EngineError::GenerationsExhausted { .. }));
    }

    #[test]
    fn test_prepare_rejects_inconsistent_segment() {
        let mut builder = SegmentBuilder::new();
        builder.add(crate::uid::DocumentFields {
            id: None,
            version: Some(1),
            seq_no: Some(0),
            primary_term: Some(1),
            soft_deleted: false,
            tombstone: false,
        });
        let broken = Arc::new(builder.build(SegmentGeneration(1)));

        let err = InMemoryEngine::with_segments(vec![broken]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Uid(UidError::InconsistentSegment { .. })
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_refresh_without_pending_is_noop() {
        let mut engine = InMemoryEngine::with_segments(Vec::new()).unwrap();
        engine.refresh().unwrap();
        assert!(engine.searcher().is_empty());
    }
}
