//! Immutable segment snapshots
//!
//! A segment holds a fixed run of document positions plus:
//! - an identity index mapping document id bytes to the positions carrying it
//! - a live mask (positions masked out are deleted)
//! - numeric columns: version, sequence number, primary term, and the
//!   soft-delete and tombstone markers
//!
//! A column is absent when no document in the segment carries the field, the
//! same way the identity index is absent when no document has an id. Deleting
//! a position never mutates a segment in place: it produces a new value with a
//! new generation, so anything bound to the old generation stays consistent.

use std::collections::BTreeMap;
use std::fmt;

use crate::store::checksum::compute_checksum;
use crate::stream::{CodecError, StreamInput, StreamOutput, MAX_LIST_LEN};

use super::errors::{UidError, UidResult};

/// Position of a document inside one segment.
pub type DocId = u32;

/// File extension used for encoded segments in a shard store.
pub const SEGMENT_FILE_EXTENSION: &str = "seg";

const SEGMENT_MAGIC: &[u8; 4] = b"PRSG";
const SEGMENT_FORMAT_VERSION: u8 = 1;

/// Identity of one immutable segment value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentGeneration(pub u64);

impl fmt::Display for SegmentGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen_{}", self.0)
    }
}

/// Sparse numeric column, one optional value per position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericColumn {
    values: Vec<Option<i64>>,
}

impl NumericColumn {
    /// Value at `doc`, `None` when the document has no value.
    pub fn get(&self, doc: DocId) -> Option<i64> {
        self.values.get(doc as usize).copied().flatten()
    }

    fn set(&mut self, doc: DocId, value: i64) {
        if let Some(slot) = self.values.get_mut(doc as usize) {
            *slot = Some(value);
        }
    }
}

/// Postings for every document id present in a segment.
///
/// Positions for each id are stored ascending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityIndex {
    postings: BTreeMap<Vec<u8>, Vec<DocId>>,
}

impl IdentityIndex {
    /// Positions carrying `id`, ascending, or `None` if the id is not indexed.
    pub fn postings(&self, id: &[u8]) -> Option<&[DocId]> {
        self.postings.get(id).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }
}

/// Fields of one document as written into a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFields {
    pub id: Option<Vec<u8>>,
    pub version: Option<i64>,
    pub seq_no: Option<i64>,
    pub primary_term: Option<i64>,
    pub soft_deleted: bool,
    pub tombstone: bool,
}

/// One immutable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    generation: SegmentGeneration,
    max_doc: u32,
    ids: Option<IdentityIndex>,
    live_docs: Option<Vec<bool>>,
    versions: Option<NumericColumn>,
    seq_nos: Option<NumericColumn>,
    primary_terms: Option<NumericColumn>,
    soft_deletes: Option<NumericColumn>,
    tombstones: Option<NumericColumn>,
}

impl Segment {
    pub fn generation(&self) -> SegmentGeneration {
        self.generation
    }

    /// Number of positions, live or not.
    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    /// Number of live positions.
    pub fn num_docs(&self) -> u32 {
        match &self.live_docs {
            None => self.max_doc,
            Some(mask) => mask.iter().filter(|live| **live).count() as u32,
        }
    }

    pub fn identity_index(&self) -> Option<&IdentityIndex> {
        self.ids.as_ref()
    }

    /// Whether `doc` survives the live mask.
    pub fn is_live(&self, doc: DocId) -> bool {
        match &self.live_docs {
            None => doc < self.max_doc,
            Some(mask) => mask.get(doc as usize).copied().unwrap_or(false),
        }
    }

    pub fn has_live_mask(&self) -> bool {
        self.live_docs.is_some()
    }

    pub fn versions(&self) -> Option<&NumericColumn> {
        self.versions.as_ref()
    }

    pub fn seq_nos(&self) -> Option<&NumericColumn> {
        self.seq_nos.as_ref()
    }

    pub fn primary_terms(&self) -> Option<&NumericColumn> {
        self.primary_terms.as_ref()
    }

    pub fn soft_deletes(&self) -> Option<&NumericColumn> {
        self.soft_deletes.as_ref()
    }

    pub fn tombstones(&self) -> Option<&NumericColumn> {
        self.tombstones.as_ref()
    }

    /// Highest sequence number stored in this segment, if any.
    pub fn max_seq_no(&self) -> Option<i64> {
        self.seq_nos
            .as_ref()
            .and_then(|col| col.values.iter().flatten().copied().max())
    }

    /// Copy of this segment with `doc` soft-deleted, under a new generation.
    pub fn with_soft_deleted(&self, doc: DocId, generation: SegmentGeneration) -> Segment {
        let mut next = self.clone();
        next.generation = generation;
        if doc >= next.max_doc {
            return next;
        }
        let max_doc = next.max_doc as usize;
        let mask = next.live_docs.get_or_insert_with(|| vec![true; max_doc]);
        mask[doc as usize] = false;
        next.soft_deletes
            .get_or_insert_with(|| NumericColumn {
                values: vec![None; max_doc],
            })
            .set(doc, 1);
        next
    }

    /// Encode into the segment file format.
    ///
    /// Layout: magic, format version, generation, max_doc, five optional
    /// numeric columns, optional identity index, optional packed live mask,
    /// then a CRC32 footer over everything before it.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = StreamOutput::with_capacity(64 + self.max_doc as usize * 8);
        for b in SEGMENT_MAGIC {
            out.write_u8(*b);
        }
        out.write_u8(SEGMENT_FORMAT_VERSION);
        out.write_vlong(self.generation.0);
        out.write_vint(self.max_doc as i32);

        for column in [
            &self.versions,
            &self.seq_nos,
            &self.primary_terms,
            &self.soft_deletes,
            &self.tombstones,
        ] {
            match column {
                None => out.write_bool(false),
                Some(col) => {
                    out.write_bool(true);
                    for value in &col.values {
                        match value {
                            Some(v) => {
                                out.write_bool(true);
                                out.write_i64(*v);
                            }
                            None => out.write_bool(false),
                        }
                    }
                }
            }
        }

        match &self.ids {
            None => out.write_bool(false),
            Some(index) => {
                out.write_bool(true);
                out.write_len(index.postings.len());
                for (id, docs) in &index.postings {
                    out.write_bytes(id);
                    out.write_len(docs.len());
                    for doc in docs {
                        out.write_vint(*doc as i32);
                    }
                }
            }
        }

        match &self.live_docs {
            None => out.write_bool(false),
            Some(mask) => {
                out.write_bool(true);
                let mut packed = vec![0u8; mask.len().div_ceil(8)];
                for (i, live) in mask.iter().enumerate() {
                    if *live {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                out.write_bytes(&packed);
            }
        }

        let checksum = compute_checksum(out.as_bytes());
        out.write_i32(checksum as i32);
        out.into_bytes()
    }

    /// Decode and validate a segment file.
    pub fn decode(data: &[u8]) -> UidResult<Segment> {
        if data.len() < SEGMENT_MAGIC.len() + 4 {
            return Err(UidError::Corrupt("segment file too short".to_string()));
        }
        let (body, footer) = data.split_at(data.len() - 4);
        let expected = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]);
        if compute_checksum(body) != expected {
            return Err(UidError::Corrupt("segment footer checksum mismatch".to_string()));
        }

        let mut input = StreamInput::new(body);
        let mut magic = [0u8; 4];
        for b in magic.iter_mut() {
            *b = input.read_u8()?;
        }
        if &magic != SEGMENT_MAGIC {
            return Err(UidError::Corrupt("bad segment magic".to_string()));
        }
        let format = input.read_u8()?;
        if format != SEGMENT_FORMAT_VERSION {
            return Err(UidError::Corrupt(format!(
                "unsupported segment format version {}",
                format
            )));
        }
        let generation = SegmentGeneration(input.read_vlong()?);
        let raw_max_doc = input.read_vint()?;
        if raw_max_doc < 0 || raw_max_doc as usize > MAX_LIST_LEN {
            return Err(UidError::Codec(CodecError::CountTooLarge {
                what: "segment documents",
                declared: raw_max_doc.max(0) as usize,
                limit: MAX_LIST_LEN,
            }));
        }
        let max_doc = raw_max_doc as u32;

        let mut columns: [Option<NumericColumn>; 5] = Default::default();
        for slot in columns.iter_mut() {
            if input.read_bool()? {
                let mut values = Vec::with_capacity((max_doc as usize).min(input.remaining()));
                for _ in 0..max_doc {
                    if input.read_bool()? {
                        values.push(Some(input.read_i64()?));
                    } else {
                        values.push(None);
                    }
                }
                *slot = Some(NumericColumn { values });
            }
        }
        let [versions, seq_nos, primary_terms, soft_deletes, tombstones] = columns;

        let ids = if input.read_bool()? {
            let count = input.read_count("identity terms", 2)?;
            let mut postings = BTreeMap::new();
            for _ in 0..count {
                let id = input.read_bytes()?;
                let docs_len = input.read_count("postings", 1)?;
                let mut docs = Vec::with_capacity(docs_len);
                for _ in 0..docs_len {
                    let doc = input.read_vint()?;
                    if doc < 0 || doc as u32 >= max_doc {
                        return Err(UidError::Corrupt(format!(
                            "posting {} out of range for max_doc {}",
                            doc, max_doc
                        )));
                    }
                    if docs.last().is_some_and(|last: &DocId| *last >= doc as u32) {
                        return Err(UidError::Corrupt("postings not ascending".to_string()));
                    }
                    docs.push(doc as u32);
                }
                postings.insert(id, docs);
            }
            Some(IdentityIndex { postings })
        } else {
            None
        };

        let live_docs = if input.read_bool()? {
            let packed = input.read_bytes()?;
            if packed.len() != (max_doc as usize).div_ceil(8) {
                return Err(UidError::Corrupt(format!(
                    "live mask has {} bytes for max_doc {}",
                    packed.len(),
                    max_doc
                )));
            }
            Some(
                (0..max_doc as usize)
                    .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
                    .collect(),
            )
        } else {
            None
        };

        input.finish()?;

        Ok(Segment {
            generation,
            max_doc,
            ids,
            live_docs,
            versions,
            seq_nos,
            primary_terms,
            soft_deletes,
            tombstones,
        })
    }
}

/// Accumulates documents and seals them into an immutable [`Segment`].
#[derive(Debug, Clone, Default)]
pub struct SegmentBuilder {
    docs: Vec<DocumentFields>,
    live: Vec<bool>,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Append a document with arbitrary fields and return its position.
    pub fn add(&mut self, fields: DocumentFields) -> DocId {
        let doc = self.docs.len() as DocId;
        self.live.push(!fields.soft_deleted);
        self.docs.push(fields);
        doc
    }

    /// Append a live document.
    pub fn add_document(
        &mut self,
        id: impl Into<Vec<u8>>,
        version: i64,
        seq_no: i64,
        primary_term: i64,
    ) -> DocId {
        self.add(DocumentFields {
            id: Some(id.into()),
            version: Some(version),
            seq_no: Some(seq_no),
            primary_term: Some(primary_term),
            soft_deleted: false,
            tombstone: false,
        })
    }

    /// Append a delete tombstone. It keeps the id and is soft-deleted from
    /// birth, so id lookups skip it; its sequence number still counts as
    /// processed for the segment.
    pub fn add_delete_tombstone(
        &mut self,
        id: impl Into<Vec<u8>>,
        version: i64,
        seq_no: i64,
        primary_term: i64,
    ) -> DocId {
        self.add(DocumentFields {
            id: Some(id.into()),
            version: Some(version),
            seq_no: Some(seq_no),
            primary_term: Some(primary_term),
            soft_deleted: true,
            tombstone: true,
        })
    }

    /// Append a no-op tombstone. It carries no id.
    pub fn add_noop_tombstone(&mut self, seq_no: i64, primary_term: i64) -> DocId {
        self.add(DocumentFields {
            id: None,
            version: Some(1),
            seq_no: Some(seq_no),
            primary_term: Some(primary_term),
            soft_deleted: true,
            tombstone: true,
        })
    }

    /// Soft-delete an already appended position.
    pub fn soft_delete(&mut self, doc: DocId) {
        if let Some(fields) = self.docs.get_mut(doc as usize) {
            fields.soft_deleted = true;
            self.live[doc as usize] = false;
        }
    }

    /// Mask a position as deleted without a soft-delete marker.
    pub fn hard_delete(&mut self, doc: DocId) {
        if let Some(live) = self.live.get_mut(doc as usize) {
            *live = false;
        }
    }

    /// Latest live position carrying `id` in the pending documents.
    pub fn find_live(&self, id: &[u8]) -> Option<DocId> {
        self.docs
            .iter()
            .enumerate()
            .rev()
            .find(|(i, d)| self.live[*i] && d.id.as_deref() == Some(id))
            .map(|(i, _)| i as DocId)
    }

    /// Pending fields at `doc`.
    pub fn fields(&self, doc: DocId) -> Option<&DocumentFields> {
        self.docs.get(doc as usize)
    }

    /// Seal the pending documents into a segment.
    pub fn build(&self, generation: SegmentGeneration) -> Segment {
        let max_doc = self.docs.len() as u32;

        fn column<F>(docs: &[DocumentFields], f: F) -> Option<NumericColumn>
        where
            F: Fn(&DocumentFields) -> Option<i64>,
        {
            let values: Vec<Option<i64>> = docs.iter().map(f).collect();
            if values.iter().any(Option::is_some) {
                Some(NumericColumn { values })
            } else {
                None
            }
        }

        let mut postings: BTreeMap<Vec<u8>, Vec<DocId>> = BTreeMap::new();
        for (doc, fields) in self.docs.iter().enumerate() {
            if let Some(id) = &fields.id {
                postings.entry(id.clone()).or_default().push(doc as DocId);
            }
        }

        let live_docs = if self.live.iter().all(|l| *l) {
            None
        } else {
            Some(self.live.clone())
        };

        Segment {
            generation,
            max_doc,
            ids: if postings.is_empty() {
                None
            } else {
                Some(IdentityIndex { postings })
            },
            live_docs,
            versions: column(&self.docs, |d| d.version),
            seq_nos: column(&self.docs, |d| d.seq_no),
            primary_terms: column(&self.docs, |d| d.primary_term),
            soft_deletes: column(&self.docs, |d| d.soft_deleted.then_some(1)),
            tombstones: column(&self.docs, |d| d.tombstone.then_some(1)),
        }
    }
}
