//! A single stored record.

use crate::index::BlobRecord;
use crate::types::{Handle, PageAddr, PageRef};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Maximum metadata length in bytes.
pub const MAX_META_SIZE: usize = 32;

/// Opaque application value attached to a blob.
pub type Stash = Arc<dyn Any + Send + Sync>;

/// Mutable blob fields. Only the durable index replaces these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlobState {
    pub meta: Vec<u8>,
    pub version: u64,
    /// `None` once the blob is deleted.
    pub page: Option<PageRef>,
}

/// One blob: identity, metadata, version and current page location.
///
/// A `Blob` is shared as `Arc<Blob>` between the handle table and callers.
/// Data is read and written through [`crate::Store`]. A deleted blob keeps
/// its metadata, version and stash as a tombstone until its slot is reused.
pub struct Blob {
    handle: Handle,
    state: RwLock<BlobState>,
    op_lock: Mutex<()>,
    stash: RwLock<Option<Stash>>,
}

impl Blob {
    pub(crate) fn new(handle: Handle, state: BlobState) -> Self {
        Self {
            handle,
            state: RwLock::new(state),
            op_lock: Mutex::new(()),
            stash: RwLock::new(None),
        }
    }

    /// Returns the blob's handle.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns a copy of the metadata bytes.
    #[must_use]
    pub fn meta(&self) -> Vec<u8> {
        self.state.read().meta.clone()
    }

    /// Returns the current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Returns the payload size, or `None` if deleted.
    #[must_use]
    pub fn size(&self) -> Option<u32> {
        self.state.read().page.map(|p| p.size)
    }

    /// Returns the page holding the payload, or `None` if deleted.
    #[must_use]
    pub fn page(&self) -> Option<PageAddr> {
        self.state.read().page.map(|p| p.addr)
    }

    /// Returns true once the blob has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state.read().page.is_none()
    }

    /// Returns `"fileId:pageId"`, or `"-1:-1"` for a deleted blob.
    #[must_use]
    pub fn location(&self) -> String {
        match self.page() {
            Some(addr) => addr.to_string(),
            None => "-1:-1".to_string(),
        }
    }

    /// CRC-32 of the metadata bytes.
    #[must_use]
    pub fn meta_crc(&self) -> u32 {
        crc32fast::hash(&self.state.read().meta)
    }

    /// Returns the application stash, if one is set.
    #[must_use]
    pub fn stash(&self) -> Option<Stash> {
        self.stash.read().clone()
    }

    /// Replaces the application stash.
    pub fn set_stash(&self, value: Option<Stash>) {
        *self.stash.write() = value;
    }

    /// Copies the fields that go into an index record.
    #[must_use]
    pub fn record(&self) -> BlobRecord {
        let state = self.state.read();
        BlobRecord {
            handle: self.handle,
            meta: state.meta.clone(),
            version: state.version,
            page: state.page,
        }
    }

    pub(crate) fn state(&self) -> BlobState {
        self.state.read().clone()
    }

    pub(crate) fn set_state(&self, state: BlobState) {
        *self.state.write() = state;
    }

    /// Serializes mutating calls on this blob.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Blob")
            .field("handle", &self.handle)
            .field("version", &state.version)
            .field("page", &state.page)
            .field("meta_len", &state.meta.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> Blob {
        Blob::new(
            Handle::new(7, 1),
            BlobState {
                meta: b"meta".to_vec(),
                version: 3,
                page: Some(PageRef::new(PageAddr::new(2, 9), 10)),
            },
        )
    }

    #[test]
    fn accessors_reflect_state() {
        let b = blob();
        assert_eq!(b.meta(), b"meta");
        assert_eq!(b.version(), 3);
        assert_eq!(b.size(), Some(10));
        assert_eq!(b.location(), "2:9");
        assert!(!b.is_deleted());
        assert_eq!(b.meta_crc(), crc32fast::hash(b"meta"));
    }

    #[test]
    fn deleted_blob_keeps_meta() {
        let b = blob();
        let mut state = b.state();
        state.page = None;
        state.version = 4;
        b.set_state(state);

        assert!(b.is_deleted());
        assert_eq!(b.size(), None);
        assert_eq!(b.location(), "-1:-1");
        assert_eq!(b.meta(), b"meta");
    }

    #[test]
    fn stash_holds_any_value() {
        let b = blob();
        assert!(b.stash().is_none());
        b.set_stash(Some(Arc::new(42u32)));
        let value = b.stash().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&42));
    }
}
