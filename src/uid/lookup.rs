//! Per-segment id → (position, version, seq_no, primary term) lookup
//!
//! A `SegmentIdLookup` owns the `Arc<Segment>` it was built for, so it can
//! only ever answer for that one generation. It keeps a little mutable state
//! between calls and is therefore not meant to be shared: each calling
//! context builds (or caches) its own.

use std::sync::Arc;

use super::errors::{UidError, UidResult};
use super::segment::{DocId, NumericColumn, Segment, SegmentGeneration};

/// Sequence number reported when the caller did not ask for it.
pub const UNASSIGNED_SEQ_NO: i64 = -2;

/// Primary term reported when the caller did not ask for it.
pub const UNASSIGNED_PRIMARY_TERM: i64 = 0;

/// Result of a version lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocIdAndVersion {
    pub doc_id: DocId,
    pub version: i64,
    /// `None` when looked up without sequence numbers
    pub seq_no: Option<i64>,
    /// `None` when looked up without sequence numbers
    pub primary_term: Option<i64>,
    pub generation: SegmentGeneration,
}

impl DocIdAndVersion {
    /// Sequence number, or [`UNASSIGNED_SEQ_NO`] when it was not loaded.
    pub fn seq_no_or_unassigned(&self) -> i64 {
        self.seq_no.unwrap_or(UNASSIGNED_SEQ_NO)
    }

    /// Primary term, or [`UNASSIGNED_PRIMARY_TERM`] when it was not loaded.
    pub fn primary_term_or_unassigned(&self) -> i64 {
        self.primary_term.unwrap_or(UNASSIGNED_PRIMARY_TERM)
    }
}

/// Result of a sequence-number lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocIdAndSeqNo {
    pub doc_id: DocId,
    pub seq_no: i64,
    pub generation: SegmentGeneration,
}

/// Lookup bound to one segment generation.
#[derive(Debug)]
pub struct SegmentIdLookup {
    segment: Arc<Segment>,
    /// Last resolved (id, position)
    last: Option<(Vec<u8>, Option<DocId>)>,
}

impl SegmentIdLookup {
    /// Bind a lookup to `segment`.
    ///
    /// Fails when the segment has no identity index and is not a no-op
    /// segment, or when it lacks the version column.
    pub fn new(segment: Arc<Segment>) -> UidResult<Self> {
        if segment.identity_index().is_none() {
            let soft_deletes = segment.soft_deletes().is_some();
            let tombstones = segment.tombstones().is_some();
            // every id was pruned because every document is deleted
            let all_docs_deleted = soft_deletes && segment.num_docs() == 0;
            if !(soft_deletes && tombstones) && !all_docs_deleted {
                return Err(UidError::InconsistentSegment {
                    generation: segment.generation(),
                    soft_deletes,
                    tombstones,
                });
            }
        }
        if segment.versions().is_none() {
            return Err(UidError::MissingVersionColumn {
                generation: segment.generation(),
            });
        }
        Ok(Self {
            segment,
            last: None,
        })
    }

    pub fn generation(&self) -> SegmentGeneration {
        self.segment.generation()
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Resolve `id` to its version, and optionally its seq_no and term.
    ///
    /// Returns `Ok(None)` when the id has no live position here.
    pub fn lookup_version(
        &mut self,
        id: &[u8],
        load_seq_no: bool,
    ) -> UidResult<Option<DocIdAndVersion>> {
        let Some(doc) = self.doc_id(id) else {
            return Ok(None);
        };
        let (seq_no, primary_term) = if load_seq_no {
            (
                Some(self.read(self.segment.seq_nos(), doc, "_seq_no")?),
                Some(self.read(self.segment.primary_terms(), doc, "_primary_term")?),
            )
        } else {
            (None, None)
        };
        let version = self.read(self.segment.versions(), doc, "_version")?;
        Ok(Some(DocIdAndVersion {
            doc_id: doc,
            version,
            seq_no,
            primary_term,
            generation: self.segment.generation(),
        }))
    }

    /// Resolve `id` to its position and sequence number only.
    pub fn lookup_seq_no(&mut self, id: &[u8]) -> UidResult<Option<DocIdAndSeqNo>> {
        let Some(doc) = self.doc_id(id) else {
            return Ok(None);
        };
        let seq_no = self.read(self.segment.seq_nos(), doc, "_seq_no")?;
        Ok(Some(DocIdAndSeqNo {
            doc_id: doc,
            seq_no,
            generation: self.segment.generation(),
        }))
    }

    /// Highest live position carrying `id`.
    ///
    /// An id can legitimately sit on several positions (nested documents
    /// share their parent's id), so the last live one wins.
    fn doc_id(&mut self, id: &[u8]) -> Option<DocId> {
        if let Some((cached_id, cached_doc)) = &self.last {
            if cached_id.as_slice() == id {
                return *cached_doc;
            }
        }
        let resolved = self
            .segment
            .identity_index()
            .and_then(|index| index.postings(id))
            .and_then(|postings| {
                postings
                    .iter()
                    .copied()
                    .filter(|doc| self.segment.is_live(*doc))
                    .last()
            });
        self.last = Some((id.to_vec(), resolved));
        resolved
    }

    fn read(
        &self,
        column: Option<&NumericColumn>,
        doc: DocId,
        field: &'static str,
    ) -> UidResult<i64> {
        column
            .and_then(|col| col.get(doc))
            .ok_or(UidError::MissingDocValue {
                generation: self.segment.generation(),
                doc,
                field,
            })
    }
}
