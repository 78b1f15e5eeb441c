//! peerrecovery - peer shard recovery
//!
//! Brings a replica copy of a shard to parity with a source copy on another
//! node: incremental file transfer, ordered operation replay, and per-segment
//! document id resolution to skip operations the replica already holds.

pub mod cli;
pub mod engine;
pub mod observability;
pub mod recovery;
pub mod shard;
pub mod store;
pub mod stream;
pub mod translog;
pub mod uid;
