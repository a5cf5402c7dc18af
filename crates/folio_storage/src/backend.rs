//! Storage backend trait definition.

use crate::error::StorageResult;

/// A positional byte store backing one physical file.
///
/// Backends are **opaque byte stores**. The durable index writes fixed-size
/// records at computed offsets and page files write whole pages at
/// `page_id * page_size`; neither needs an append cursor.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` either syncs before returning (strict mode) or marks the
///   backend dirty (deferred mode)
/// - `flush` syncs a dirty backend and clears the dirty flag
/// - After `close`, every operation fails with [`crate::StorageError::Closed`]
///
/// # Implementors
///
/// - [`super::RawFile`] - For persistent storage
/// - [`super::MemFile`] - For testing
pub trait StorageBackend: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - The backend is closed
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes `data` at `offset`, growing the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is closed or an I/O error occurs.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Syncs pending writes if the backend is dirty.
    ///
    /// A clean backend returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn flush(&self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Returns true if writes have been made since the last sync.
    fn is_dirty(&self) -> bool;

    /// Closes the backend. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a final sync of dirty data fails.
    fn close(&self) -> StorageResult<()>;
}
