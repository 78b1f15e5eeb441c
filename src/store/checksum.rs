//! CRC32 checksums for store files, file chunks and segment footers
//!
//! Uses CRC32 (IEEE polynomial) throughout. A file's checksum is the CRC32
//! of its full content; a chunk's checksum is the CRC32 of that chunk only.

use std::io::{self, Read};

use crc32fast::Hasher;

/// Computes a CRC32 checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies that the computed checksum matches the expected checksum.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}

/// Computes a CRC32 checksum over everything `reader` yields.
pub fn checksum_reader<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
