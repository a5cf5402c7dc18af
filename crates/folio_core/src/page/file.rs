//! A single physical page file.

use super::{FreeBitmap, PAGES_PER_FILE};
use crate::error::{CoreError, CoreResult};
use folio_storage::StorageBackend;
use parking_lot::{Mutex, MutexGuard};

/// One physical file of fixed-size pages of a single size class.
///
/// Page `n` occupies bytes `n * page_size .. (n + 1) * page_size`. Pages are
/// not padded on disk; only payload bytes are written.
///
/// Page I/O goes straight to the backend, whose own lock serializes access
/// to this file. The bitmap is only touched while the [`super::PageManager`]
/// lock is held.
pub struct PageFile {
    file_id: u32,
    page_size: u32,
    backend: Box<dyn StorageBackend>,
    bitmap: Mutex<FreeBitmap>,
}

impl PageFile {
    /// Wraps a backend as page file `file_id` with pages of `page_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bitmap cannot be created.
    pub fn new(file_id: u32, page_size: u32, backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        Ok(Self {
            file_id,
            page_size,
            backend,
            bitmap: Mutex::new(FreeBitmap::new(PAGES_PER_FILE)?),
        })
    }

    /// Returns the global file id.
    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Returns the page size of this file's size class.
    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Reads the first `len` bytes of a page.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` if `len` is larger than a page, or a storage
    /// error if the bytes were never written.
    pub fn read(&self, page_id: u32, len: u32) -> CoreResult<Vec<u8>> {
        self.check_bounds(page_id, 0, len as usize)?;
        let mut buf = vec![0u8; len as usize];
        if len > 0 {
            self.backend.read_at(self.page_offset(page_id), &mut buf)?;
        }
        Ok(buf)
    }

    /// Writes `data` into a page starting `offset` bytes into it.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` if the write crosses the page end.
    pub fn write(&self, page_id: u32, offset: u32, data: &[u8]) -> CoreResult<()> {
        self.check_bounds(page_id, offset, data.len())?;
        self.backend
            .write_at(self.page_offset(page_id) + u64::from(offset), data)?;
        Ok(())
    }

    /// Syncs pending writes.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Returns true if writes are waiting for a flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.backend.is_dirty()
    }

    /// Closes the underlying backend.
    pub fn close(&self) -> CoreResult<()> {
        self.backend.close()?;
        Ok(())
    }

    /// Number of pages currently allocated.
    #[must_use]
    pub fn used_pages(&self) -> u32 {
        self.bitmap.lock().num_used()
    }

    pub(crate) fn bitmap(&self) -> MutexGuard<'_, FreeBitmap> {
        self.bitmap.lock()
    }

    fn page_offset(&self, page_id: u32) -> u64 {
        u64::from(page_id) * u64::from(self.page_size)
    }

    fn check_bounds(&self, page_id: u32, offset: u32, len: usize) -> CoreResult<()> {
        if page_id >= PAGES_PER_FILE {
            return Err(CoreError::limit_exceeded(format!(
                "page {page_id} out of range in file {}",
                self.file_id
            )));
        }
        if offset as usize + len > self.page_size as usize {
            return Err(CoreError::limit_exceeded(format!(
                "{len} bytes at offset {offset} overflow {}-byte page",
                self.page_size
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("file_id", &self.file_id)
            .field("page_size", &self.page_size)
            .field("used_pages", &self.used_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_storage::MemFile;

    fn page_file(page_size: u32) -> PageFile {
        PageFile::new(0, page_size, Box::new(MemFile::new())).unwrap()
    }

    #[test]
    fn pages_do_not_overlap() {
        let file = page_file(16);
        file.write(1, 0, b"second page").unwrap();
        file.write(0, 0, b"first page").unwrap();

        assert_eq!(file.read(0, 10).unwrap(), b"first page");
        assert_eq!(file.read(1, 11).unwrap(), b"second page");
    }

    #[test]
    fn write_at_tail_offset() {
        let file = page_file(32);
        file.write(2, 0, b"hello").unwrap();
        file.write(2, 5, b" world").unwrap();
        assert_eq!(file.read(2, 11).unwrap(), b"hello world");
    }

    #[test]
    fn write_past_page_end_rejected() {
        let file = page_file(16);
        assert!(matches!(
            file.write(0, 10, b"too long!"),
            Err(CoreError::LimitExceeded { .. })
        ));
        assert!(file.write(PAGES_PER_FILE, 0, b"x").is_err());
    }

    #[test]
    fn empty_read_never_touches_backend() {
        let file = page_file(16);
        assert!(file.read(7, 0).unwrap().is_empty());
    }
}
