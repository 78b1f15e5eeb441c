//! Directory-backed shard store
//!
//! Files are flat, named entries in one directory. Recovery writes incoming
//! files under a temporary name (`recovery.<recovery_id>.<name>`) and only
//! renames them to their live names once the whole transfer is verified.
//!
//! A source takes a pinned [`StoreSnapshot`]; while any snapshot pins a file
//! name, the store refuses to delete that file.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::checksum::checksum_reader;
use super::errors::{StoreError, StoreResult};
use super::metadata::FileMetadata;

/// Prefix of every temporary recovery file.
pub const TEMP_FILE_PREFIX: &str = "recovery.";

type PinTable = Arc<Mutex<HashMap<String, usize>>>;

/// A shard's durable file set.
#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
    pins: PinTable,
}

impl ShardStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;
        Ok(Self {
            dir,
            pins: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Temporary name for `name` within recovery `recovery_id`.
    pub fn temp_file_name(recovery_id: i64, name: &str) -> String {
        format!("{}{}.{}", TEMP_FILE_PREFIX, recovery_id, name)
    }

    pub fn is_temp_file(name: &str) -> bool {
        name.starts_with(TEMP_FILE_PREFIX)
    }

    fn file_path(&self, name: &str) -> StoreResult<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    fn file_names(&self) -> StoreResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io(format!("list {}", self.dir.display()), e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list entry", e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| StoreError::io("stat entry", e))?
                .is_file();
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Metadata for `name`, reading the file to compute its checksum.
    pub fn metadata(&self, name: &str) -> StoreResult<FileMetadata> {
        let path = self.file_path(name)?;
        let mut file = File::open(&path).map_err(|e| StoreError::io(name, e))?;
        let length = file
            .metadata()
            .map_err(|e| StoreError::io(format!("stat {}", name), e))?
            .len();
        let checksum =
            checksum_reader(&mut file).map_err(|e| StoreError::io(format!("read {}", name), e))?;
        Ok(FileMetadata::new(name, length, checksum))
    }

    /// Metadata of every live (non-temporary) file, sorted by name.
    pub fn list_metadata(&self) -> StoreResult<Vec<FileMetadata>> {
        self.file_names()?
            .into_iter()
            .filter(|name| !Self::is_temp_file(name))
            .map(|name| self.metadata(&name))
            .collect()
    }

    /// Names of every temporary recovery file currently on disk.
    pub fn temp_files(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .file_names()?
            .into_iter()
            .filter(|name| Self::is_temp_file(name))
            .collect())
    }

    /// Take a pinned snapshot of the live file set.
    pub fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        let files = self.list_metadata()?;
        {
            let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
            for file in &files {
                *pins.entry(file.name.clone()).or_insert(0) += 1;
            }
        }
        Ok(StoreSnapshot {
            files,
            pins: Arc::clone(&self.pins),
        })
    }

    /// Number of file names currently pinned by at least one snapshot.
    pub fn pinned_files(&self) -> usize {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_pinned(&self, name: &str) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Read `len` bytes of `name` starting at `position`.
    pub fn read_chunk(&self, name: &str, position: u64, len: usize) -> StoreResult<Vec<u8>> {
        let path = self.file_path(name)?;
        let mut file = File::open(&path).map_err(|e| StoreError::io(name, e))?;
        let length = file
            .metadata()
            .map_err(|e| StoreError::io(format!("stat {}", name), e))?
            .len();
        if position + len as u64 > length {
            return Err(StoreError::OutOfRange {
                name: name.to_string(),
                position,
                len: len as u64,
                length,
            });
        }
        file.seek(SeekFrom::Start(position))
            .map_err(|e| StoreError::io(format!("seek {}", name), e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| StoreError::io(format!("read {}", name), e))?;
        Ok(buf)
    }

    /// Read a whole file.
    pub fn read_file(&self, name: &str) -> StoreResult<Vec<u8>> {
        let path = self.file_path(name)?;
        fs::read(&path).map_err(|e| StoreError::io(name, e))
    }

    /// Write a whole file and fsync it.
    pub fn write_file(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.file_path(name)?;
        let mut file = File::create(&path).map_err(|e| StoreError::io(format!("create {}", name), e))?;
        file.write_all(data)
            .map_err(|e| StoreError::io(format!("write {}", name), e))?;
        file.sync_all()
            .map_err(|e| StoreError::io(format!("fsync {}", name), e))
    }

    /// Create (or truncate) a file preallocated to `length` bytes.
    pub fn create_sized(&self, name: &str, length: u64) -> StoreResult<()> {
        let path = self.file_path(name)?;
        let file = File::create(&path).map_err(|e| StoreError::io(format!("create {}", name), e))?;
        file.set_len(length)
            .map_err(|e| StoreError::io(format!("size {}", name), e))
    }

    /// Write `data` into an existing file at `position`.
    pub fn write_at(&self, name: &str, position: u64, data: &[u8]) -> StoreResult<()> {
        let path = self.file_path(name)?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(name, e))?;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| StoreError::io(format!("seek {}", name), e))?;
        file.write_all(data)
            .map_err(|e| StoreError::io(format!("write {}", name), e))
    }

    /// Recompute the checksum of `name` and compare it with `expected`.
    pub fn verify(&self, name: &str, expected: &FileMetadata) -> StoreResult<()> {
        let actual = self.metadata(name)?;
        if actual.length != expected.length || actual.checksum != expected.checksum {
            return Err(StoreError::ChecksumMismatch {
                name: expected.name.clone(),
                expected: expected.checksum,
                actual: actual.checksum,
            });
        }
        Ok(())
    }

    pub fn fsync(&self, name: &str) -> StoreResult<()> {
        let path = self.file_path(name)?;
        let file = File::open(&path).map_err(|e| StoreError::io(name, e))?;
        file.sync_all()
            .map_err(|e| StoreError::io(format!("fsync {}", name), e))
    }

    /// Atomically replace `to` with `from`.
    pub fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let from_path = self.file_path(from)?;
        let to_path = self.file_path(to)?;
        fs::rename(&from_path, &to_path)
            .map_err(|e| StoreError::io(format!("rename {} -> {}", from, to), e))
    }

    /// Make renames and deletions in the directory durable.
    pub fn sync_directory(&self) -> StoreResult<()> {
        #[cfg(unix)]
        {
            let dir = File::open(&self.dir)
                .map_err(|e| StoreError::io(format!("open {}", self.dir.display()), e))?;
            dir.sync_all()
                .map_err(|e| StoreError::io(format!("fsync {}", self.dir.display()), e))?;
        }
        Ok(())
    }

    /// Delete `name` unless a snapshot pins it. Missing files are fine.
    pub fn delete(&self, name: &str) -> StoreResult<()> {
        if self.is_pinned(name) {
            return Err(StoreError::Pinned(name.to_string()));
        }
        let path = self.file_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("delete {}", name), e)),
        }
    }

    /// Delete every live file not named in `keep`. Returns the deleted names.
    pub fn cleanup_except(&self, keep: &HashSet<String>) -> StoreResult<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.file_names()? {
            if Self::is_temp_file(&name) || keep.contains(&name) {
                continue;
            }
            self.delete(&name)?;
            deleted.push(name);
        }
        Ok(deleted)
    }

    /// Delete every temporary file belonging to `recovery_id`.
    pub fn remove_temp_files(&self, recovery_id: i64) -> StoreResult<usize> {
        let prefix = format!("{}{}.", TEMP_FILE_PREFIX, recovery_id);
        let mut removed = 0;
        for name in self.file_names()? {
            if name.starts_with(&prefix) {
                self.delete(&name)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Immutable view of a store's files, pinned until dropped.
#[derive(Debug)]
pub struct StoreSnapshot {
    files: Vec<FileMetadata>,
    pins: PinTable,
}

impl StoreSnapshot {
    pub fn files(&self) -> &[FileMetadata] {
        &self.files
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

impl Drop for StoreSnapshot {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        for file in &self.files {
            if let Some(count) = pins.get_mut(&file.name) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(&file.name);
                }
            }
        }
    }
}
