//! Shard and node identity
//!
//! A `ShardId` names one logical shard of an index and is stable for the
//! shard's lifetime. A `NodeId` names a cluster node; recovery only ever
//! carries it around for reporting, it never resolves it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::{CodecResult, StreamInput, StreamOutput};

/// Index identity: human-readable name plus the UUID assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId {
    pub name: String,
    pub uuid: String,
}

impl IndexId {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }
}

/// (index, shard number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: IndexId,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: IndexId, shard: u32) -> Self {
        Self { index, shard }
    }

    /// Write in wire order: index name, index uuid, shard number.
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_string(&self.index.name);
        out.write_string(&self.index.uuid);
        out.write_vint(self.shard as i32);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        let name = input.read_string()?;
        let uuid = input.read_string()?;
        let shard = input.read_vint()?;
        if shard < 0 {
            return Err(crate::stream::CodecError::InvalidData(format!(
                "negative shard number {}",
                shard
            )));
        }
        Ok(Self {
            index: IndexId { name, uuid },
            shard: shard as u32,
        })
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index.name, self.shard)
    }
}

/// Cluster node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub id: Uuid,
    pub name: String,
}

impl NodeId {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Generate a fresh node identity with the given name.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), name)
    }

    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_string(&self.id.to_string());
        out.write_string(&self.name);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        let raw = input.read_string()?;
        let id = Uuid::parse_str(&raw).map_err(|e| {
            crate::stream::CodecError::InvalidData(format!("invalid node id '{}': {}", raw, e))
        })?;
        let name = input.read_string()?;
        Ok(Self { id, name })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_display() {
        let shard = ShardId::new(IndexId::new("logs", "u1"), 3);
        assert_eq!(shard.to_string(), "[logs][3]");
    }

    #[test]
    fn test_shard_id_wire_order() {
        let shard = ShardId::new(IndexId::new("ab", "c"), 1);
        let mut out = StreamOutput::new();
        shard.write_to(&mut out);
        assert_eq!(out.as_bytes(), &[2, b'a', b'b', 1, b'c', 1]);

        let mut input = StreamInput::new(out.as_bytes());
        assert_eq!(ShardId::read_from(&mut input).unwrap(), shard);
    }

    #[test]
    fn test_node_id_rejects_garbage_uuid() {
        let mut out = StreamOutput::new();
        out.write_string("not-a-uuid");
        out.write_string("node");
        let mut input = StreamInput::new(out.as_bytes());
        assert!(NodeId::read_from(&mut input).is_err());
    }
}
