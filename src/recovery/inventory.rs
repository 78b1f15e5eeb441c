//! File inventory and incremental diff
//!
//! A source file is skipped only when the target already holds a file with
//! the same name, length and checksum. Everything else is sent, including a
//! file the target holds under the same name with different content.

use std::collections::HashSet;

use serde::Serialize;

use crate::store::FileMetadata;

/// Partition of the source's files for one recovery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FileInventory {
    to_send: Vec<FileMetadata>,
    already_present: Vec<FileMetadata>,
}

/// Split `source_files` into files to transfer and files the target already
/// has. Both outputs keep source order.
pub fn diff(source_files: &[FileMetadata], target_files: &[FileMetadata]) -> FileInventory {
    let existing: HashSet<&FileMetadata> = target_files.iter().collect();
    let (already_present, to_send): (Vec<FileMetadata>, Vec<FileMetadata>) = source_files
        .iter()
        .cloned()
        .partition(|file| existing.contains(file));
    FileInventory {
        to_send,
        already_present,
    }
}

impl FileInventory {
    pub fn to_send(&self) -> &[FileMetadata] {
        &self.to_send
    }

    pub fn already_present(&self) -> &[FileMetadata] {
        &self.already_present
    }

    pub fn phase1_file_names(&self) -> Vec<String> {
        self.to_send.iter().map(|f| f.name.clone()).collect()
    }

    pub fn phase1_file_sizes(&self) -> Vec<u64> {
        self.to_send.iter().map(|f| f.length).collect()
    }

    pub fn phase1_existing_file_names(&self) -> Vec<String> {
        self.already_present.iter().map(|f| f.name.clone()).collect()
    }

    pub fn phase1_existing_file_sizes(&self) -> Vec<u64> {
        self.already_present.iter().map(|f| f.length).collect()
    }

    pub fn total_files(&self) -> usize {
        self.to_send.len() + self.already_present.len()
    }

    pub fn bytes_to_send(&self) -> u64 {
        self.to_send.iter().map(|f| f.length).sum()
    }

    pub fn bytes_reused(&self) -> u64 {
        self.already_present.iter().map(|f| f.length).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_to_send() + self.bytes_reused()
    }
}
