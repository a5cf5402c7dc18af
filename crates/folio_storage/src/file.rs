//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::sync::SyncPolicy;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// A single physical file with positional read/write and deferred sync.
///
/// # Durability
///
/// - In strict mode every `write_at` calls `File::sync_all()` before
///   returning
/// - In deferred mode `write_at` only marks the file dirty and `flush()`
///   performs the sync
///
/// # Thread Safety
///
/// The file handle lives behind a mutex, so concurrent readers and writers
/// of the same file are serialized. Different files never contend.
///
/// # Example
///
/// ```no_run
/// use folio_storage::{FlushMode, RawFile, StorageBackend, SyncPolicy};
/// use std::path::Path;
///
/// let file = RawFile::open(Path::new("data.bin"), SyncPolicy::new(FlushMode::NoSync)).unwrap();
/// file.write_at(0, b"persistent data").unwrap();
/// file.flush().unwrap(); // ensure data is durable
/// ```
#[derive(Debug)]
pub struct RawFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
    dirty: AtomicBool,
    policy: SyncPolicy,
}

impl RawFile {
    /// Opens or creates a file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path, policy: SyncPolicy) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            dirty: AtomicBool::new(false),
            policy,
        })
    }

    /// Opens or creates a file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path, policy: SyncPolicy) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path, policy)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for RawFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;

        let size = file.metadata()?.len();
        let end = offset.saturating_add(buf.len() as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        if self.policy.is_deferred() {
            self.dirty.store(true, Ordering::SeqCst);
        } else {
            file.sync_all()?;
            self.dirty.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;

        if self.dirty.load(Ordering::SeqCst) {
            file.sync_all()?;
            self.dirty.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(file.metadata()?.len())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            if self.dirty.swap(false, Ordering::SeqCst) {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}
