//! File metadata as exchanged during recovery

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::{CodecResult, StreamInput, StreamOutput};

/// Name, length and CRC32 of one store file.
///
/// Two instances describe the same bytes for recovery purposes iff all three
/// fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub length: u64,
    pub checksum: u32,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, length: u64, checksum: u32) -> Self {
        Self {
            name: name.into(),
            length,
            checksum,
        }
    }

    /// Same name, length and checksum.
    pub fn is_same(&self, other: &FileMetadata) -> bool {
        self == other
    }

    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_string(&self.name);
        out.write_vlong(self.length);
        out.write_i32(self.checksum as i32);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        let name = input.read_string()?;
        let length = input.read_vlong()?;
        let checksum = input.read_i32()? as u32;
        Ok(Self {
            name,
            length,
            checksum,
        })
    }
}

impl fmt::Display for FileMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name [{}], length [{}], checksum [{:08x}]",
            self.name, self.length, self.checksum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_needs_all_fields() {
        let a = FileMetadata::new("a", 100, 7);
        assert!(a.is_same(&FileMetadata::new("a", 100, 7)));
        assert!(!a.is_same(&FileMetadata::new("a", 101, 7)));
        assert!(!a.is_same(&FileMetadata::new("a", 100, 8)));
        assert!(!a.is_same(&FileMetadata::new("b", 100, 7)));
    }

    #[test]
    fn test_high_bit_checksum_survives_wire() {
        let meta = FileMetadata::new("_1.seg", 1 << 40, 0xDEAD_BEEF);
        let mut out = StreamOutput::new();
        meta.write_to(&mut out);
        let mut input = StreamInput::new(out.as_bytes());
        assert_eq!(FileMetadata::read_from(&mut input).unwrap(), meta);
    }
}
