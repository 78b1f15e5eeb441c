//! Multi-segment id resolution
//!
//! Walks a reader's segments newest-first and answers from the first segment
//! that holds a live position for the id. Per-segment lookups are cached by
//! generation in an `IdResolver` owned by the caller; generations that have
//! left the segment list are evicted so a lookup never outlives its segment.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use super::errors::UidResult;
use super::lookup::{DocIdAndSeqNo, DocIdAndVersion, SegmentIdLookup};
use super::segment::{Segment, SegmentGeneration};

/// Caller-owned cache of per-segment lookups.
#[derive(Debug, Default)]
pub struct IdResolver {
    lookups: HashMap<SegmentGeneration, SegmentIdLookup>,
}

impl IdResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached per-segment lookups.
    pub fn cached(&self) -> usize {
        self.lookups.len()
    }

    /// Resolve `id` across `segments` (ordered oldest → newest).
    pub fn load_doc_id_and_version(
        &mut self,
        segments: &[Arc<Segment>],
        id: &[u8],
        load_seq_no: bool,
    ) -> UidResult<Option<DocIdAndVersion>> {
        self.evict_stale(segments);
        for segment in segments.iter().rev() {
            let lookup = self.lookup_for(segment)?;
            if let Some(found) = lookup.lookup_version(id, load_seq_no)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Resolve `id` to its position and sequence number across `segments`.
    pub fn load_doc_id_and_seq_no(
        &mut self,
        segments: &[Arc<Segment>],
        id: &[u8],
    ) -> UidResult<Option<DocIdAndSeqNo>> {
        self.evict_stale(segments);
        for segment in segments.iter().rev() {
            let lookup = self.lookup_for(segment)?;
            if let Some(found) = lookup.lookup_seq_no(id)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Convenience: version only, or `None`.
    pub fn load_version(
        &mut self,
        segments: &[Arc<Segment>],
        id: &[u8],
    ) -> UidResult<Option<i64>> {
        Ok(self
            .load_doc_id_and_version(segments, id, false)?
            .map(|found| found.version))
    }

    fn lookup_for(&mut self, segment: &Arc<Segment>) -> UidResult<&mut SegmentIdLookup> {
        match self.lookups.entry(segment.generation()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(SegmentIdLookup::new(Arc::clone(segment))?)),
        }
    }

    fn evict_stale(&mut self, segments: &[Arc<Segment>]) {
        if self.lookups.is_empty() {
            return;
        }
        self.lookups
            .retain(|generation, _| segments.iter().any(|s| s.generation() == *generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::segment::SegmentBuilder;

    fn segment(generation: u64, docs: &[(&str, i64)]) -> Arc<Segment> {
        let mut builder = SegmentBuilder::new();
        for (id, seq_no) in docs {
            builder.add_document(*id, 1, *seq_no, 1);
        }
        Arc::new(builder.build(SegmentGeneration(generation)))
    }

    #[test]
    fn test_newest_segment_wins() {
        let segments = vec![segment(1, &[("a", 1)]), segment(2, &[("a", 5)])];
        let mut resolver = IdResolver::new();
        let found = resolver.load_doc_id_and_seq_no(&segments, b"a").unwrap().unwrap();
        assert_eq!(found.seq_no, 5);
        assert_eq!(found.generation, SegmentGeneration(2));
    }

    #[test]
    fn test_falls_back_to_older_segment() {
        let segments = vec![segment(1, &[("a", 1)]), segment(2, &[("b", 2)])];
        let mut resolver = IdResolver::new();
        let found = resolver
            .load_doc_id_and_version(&segments, b"a", true)
            .unwrap()
            .unwrap();
        assert_eq!(found.seq_no, Some(1));
        assert_eq!(resolver.load_version(&segments, b"zzz").unwrap(), None);
    }

    #[test]
    fn test_replaced_generation_is_evicted() {
        let original = segment(1, &[("a", 1)]);
        let mut resolver = IdResolver::new();
        assert!(resolver
            .load_doc_id_and_seq_no(&[Arc::clone(&original)], b"a")
            .unwrap()
            .is_some());
        assert_eq!(resolver.cached(), 1);

        let replaced = Arc::new(original.with_soft_deleted(0, SegmentGeneration(2)));
        assert!(resolver
            .load_doc_id_and_seq_no(&[replaced], b"a")
            .unwrap()
            .is_none());
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn test_inconsistent_segment_surfaces() {
        use crate::uid::segment::DocumentFields;
        let mut builder = SegmentBuilder::new();
        builder.add(DocumentFields {
            id: None,
            version: Some(1),
            seq_no: Some(1),
            primary_term: Some(1),
            ..Default::default()
        });
        let segments = vec![Arc::new(builder.build(SegmentGeneration(9)))];
        let mut resolver = IdResolver::new();
        let err = resolver.load_doc_id_and_seq_no(&segments, b"a").unwrap_err();
        assert!(err.is_fatal());
    }
}
