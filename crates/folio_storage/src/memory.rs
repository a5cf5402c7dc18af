//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory positional byte store.
///
/// Writes past the end zero-fill the gap, matching sparse file behavior.
/// `MemFile` never needs a sync, but it still tracks the dirty flag so
/// callers can test deferred-sync bookkeeping without touching disk.
///
/// # Example
///
/// ```rust
/// use folio_storage::{MemFile, StorageBackend};
///
/// let file = MemFile::new();
/// file.write_at(4, b"test").unwrap();
/// assert_eq!(file.size().unwrap(), 8);
/// assert_eq!(file.data(), b"\0\0\0\0test");
/// ```
#[derive(Debug, Default)]
pub struct MemFile {
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    deferred: bool,
    closed: AtomicBool,
}

impl MemFile {
    /// Creates a new empty in-memory file in strict mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory file that marks itself dirty on write.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    /// Creates an in-memory file with pre-existing contents.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            ..Self::default()
        }
    }

    /// Returns a copy of all bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.check_open()?;
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(buf.len() as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }

        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);

        if self.deferred {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.check_open()?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(self.data.read().len() as u64)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn close(&self) -> StorageResult<()> {
        self.dirty.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_write_then_read() {
        let file = MemFile::new();
        file.write_at(0, b"hello world").unwrap();

        let mut buf = [0u8; 5];
        file.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn memory_gap_is_zero_filled() {
        let file = MemFile::new();
        file.write_at(10, b"x").unwrap();

        let mut buf = [0xffu8; 10];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 10]);
    }

    #[test]
    fn memory_read_past_end_fails() {
        let file = MemFile::with_data(b"abc".to_vec());
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.read_at(0, &mut buf),
            Err(StorageError::ReadPastEnd { size: 3, .. })
        ));
    }

    #[test]
    fn memory_deferred_dirty_flag() {
        let file = MemFile::deferred();
        assert!(!file.is_dirty());
        file.write_at(0, b"a").unwrap();
        assert!(file.is_dirty());
        file.flush().unwrap();
        assert!(!file.is_dirty());
    }

    #[test]
    fn memory_closed_rejects_io() {
        let file = MemFile::new();
        file.close().unwrap();
        assert!(matches!(file.write_at(0, b"a"), Err(StorageError::Closed)));
    }

    proptest! {
        #[test]
        fn last_write_wins(writes in prop::collection::vec((0u64..64, prop::collection::vec(any::<u8>(), 0..16)), 1..20)) {
            let file = MemFile::new();
            let mut model = Vec::new();
            for (offset, bytes) in &writes {
                file.write_at(*offset, bytes).unwrap();
                let end = *offset as usize + bytes.len();
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[*offset as usize..end].copy_from_slice(bytes);
            }
            prop_assert_eq!(file.data(), model);
        }
    }
}
