//! Durable storage for the history index watermark.

use crate::error::{Result, SyncError};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the watermark file.
const WATERMARK_MAGIC: &[u8; 4] = b"RSW\0";

/// Current watermark format version.
const WATERMARK_VERSION: u8 = 1;

/// magic + version + watermark + checksum
const WATERMARK_FILE_SIZE: usize = 4 + 1 + 8 + 4;

const WATERMARK_FILE: &str = "history_index";
const LOCK_FILE: &str = "LOCK";

/// Where the history buffer keeps its next index across restarts.
///
/// Only the watermark is durable; region bodies always live in memory.
pub trait WatermarkStore: Send + Sync {
    /// The last persisted watermark, or `None` on a fresh store.
    fn load_watermark(&self) -> Result<Option<u64>>;

    /// Persist `index` as the new watermark.
    fn save_watermark(&self, index: u64) -> Result<()>;
}

/// File-backed watermark store.
///
/// Holds an exclusive lock on its directory for as long as it is open, so two
/// coordinators never hand out indices from the same watermark.
pub struct FileWatermarkStore {
    dir: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Serializes writers; the rename dance is not safe to interleave.
    write_lock: Mutex<()>,
}

impl FileWatermarkStore {
    /// Open (creating if needed) a watermark store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_file = Self::acquire_lock(&dir)?;

        Ok(Self {
            dir,
            _lock_file: lock_file,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the watermark file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(WATERMARK_FILE)
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }

    fn encode(index: u64) -> [u8; WATERMARK_FILE_SIZE] {
        let mut buf = [0u8; WATERMARK_FILE_SIZE];
        let index_bytes = index.to_le_bytes();
        buf[0..4].copy_from_slice(WATERMARK_MAGIC);
        buf[4] = WATERMARK_VERSION;
        buf[5..13].copy_from_slice(&index_bytes);
        buf[13..17].copy_from_slice(&crc32fast::hash(&index_bytes).to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<u64> {
        if buf.len() != WATERMARK_FILE_SIZE {
            return Err(SyncError::InvalidFormat(format!(
                "Watermark file has {} bytes, expected {}",
                buf.len(),
                WATERMARK_FILE_SIZE
            )));
        }

        if &buf[0..4] != WATERMARK_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid watermark magic".into()));
        }

        if buf[4] != WATERMARK_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported watermark version: {}",
                buf[4]
            )));
        }

        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&buf[5..13]);
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&buf[13..17]);

        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&index_bytes);
        if stored_checksum != computed_checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(u64::from_le_bytes(index_bytes))
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn load_watermark(&self) -> Result<Option<u64>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(WATERMARK_FILE_SIZE);
        File::open(&path)?.read_to_end(&mut buf)?;

        Self::decode(&buf).map(Some)
    }

    fn save_watermark(&self, index: u64) -> Result<()> {
        let _lock = self.write_lock.lock();

        let tmp_path = self.dir.join(format!("{}.tmp", WATERMARK_FILE));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&Self::encode(index))?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, self.path())?;
        Ok(())
    }
}

/// In-memory watermark store, for tests and for coordinators that accept
/// index reuse across restarts.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    watermark: Mutex<Option<u64>>,
    saves: Mutex<u64>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a watermark, as if persisted by an earlier run.
    pub fn with_watermark(index: u64) -> Self {
        Self {
            watermark: Mutex::new(Some(index)),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful `save_watermark` calls.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load_watermark(&self) -> Result<Option<u64>> {
        Ok(*self.watermark.lock())
    }

    fn save_watermark(&self, index: u64) -> Result<()> {
        *self.watermark.lock() = Some(index);
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_store_has_no_watermark() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        assert_eq!(store.load_watermark().unwrap(), None);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let store = FileWatermarkStore::open(dir.path()).unwrap();
            store.save_watermark(41).unwrap();
            store.save_watermark(42).unwrap();
        }

        // Reopen and verify
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        assert_eq!(store.load_watermark().unwrap(), Some(42));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _first = FileWatermarkStore::open(dir.path()).unwrap();

        let second = FileWatermarkStore::open(dir.path());
        assert!(matches!(second, Err(SyncError::Locked)));
    }

    #[test]
    fn test_corrupt_checksum_detected() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        store.save_watermark(7).unwrap();

        let mut bytes = fs::read(store.path()).unwrap();
        bytes[5] ^= 0xff;
        fs::write(store.path(), &bytes).unwrap();

        let result = store.load_watermark();
        assert!(matches!(result, Err(SyncError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_bad_magic_detected() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        store.save_watermark(7).unwrap();

        let mut bytes = fs::read(store.path()).unwrap();
        bytes[0] = b'X';
        fs::write(store.path(), &bytes).unwrap();

        assert!(matches!(
            store.load_watermark(),
            Err(SyncError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemoryWatermarkStore::with_watermark(3);
        assert_eq!(store.load_watermark().unwrap(), Some(3));

        store.save_watermark(4).unwrap();
        assert_eq!(store.load_watermark().unwrap(), Some(4));
        assert_eq!(store.save_count(), 1);
    }
}
