//! Shard file store
//!
//! A shard's durable state is a flat directory of immutable files. Recovery
//! reads source files in chunks from a pinned snapshot and stages incoming
//! files on the target under temporary names.

pub mod checksum;
mod directory;
mod errors;
mod metadata;

pub use directory::{ShardStore, StoreSnapshot, TEMP_FILE_PREFIX};
pub use errors::{StoreError, StoreResult};
pub use metadata::FileMetadata;
