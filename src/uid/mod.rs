//! Document identity resolution
//!
//! Maps an opaque document id to its position, version, sequence number and
//! primary term inside immutable segments. Recovery uses it to recognise
//! operations the target already holds; reads use it for get-by-id.
//!
//! # Rules
//!
//! - A lookup is bound to exactly one segment generation
//! - A segment without an identity index must be a no-op segment, anything
//!   else is corruption and fatal
//! - Among live positions carrying the same id, the highest position wins

mod errors;
mod lookup;
mod resolver;
pub mod segment;

pub use errors::{UidError, UidResult};
pub use lookup::{
    DocIdAndSeqNo, DocIdAndVersion, SegmentIdLookup, UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO,
};
pub use resolver::IdResolver;
pub use segment::{
    DocId, DocumentFields, IdentityIndex, NumericColumn, Segment, SegmentBuilder,
    SegmentGeneration, SEGMENT_FILE_EXTENSION,
};
