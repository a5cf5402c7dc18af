//! Durable handle index.
//!
//! The index file is an array of fixed 56-byte big-endian records. Record 0
//! is the header; the record for slot `n` lives at offset `(n + 1) * 56`.
//!
//! ```text
//! header: | magic u64 | format version u32 | history page size ns u64 | zero pad |
//! blob:   | generation u32 | unused u8 | meta len u8 | meta [32] | version u64 |
//!         | size u32 | file id u32 | page id u16 |
//! ```
//!
//! A blob record with generation zero is a tombstone: only its version is
//! kept. An all-zero record is a slot that was never used.
//!
//! Replaying the file on open rebuilds the handle table, the version
//! counter and the page bitmaps; nothing else is persisted.

use crate::blob::{Blob, BlobState, MAX_META_SIZE};
use crate::error::{CoreError, CoreResult};
use crate::handles::HandleTable;
use crate::page::{PageManager, MAX_PAGE_SIZE};
use crate::types::{Handle, PageAddr, PageRef};
use folio_storage::StorageBackend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Size of one index record.
pub const RECORD_SIZE: usize = 56;

/// Magic number at the start of the index file ("folioSto").
pub const INDEX_MAGIC: u64 = 0x666f_6c69_6f53_746f;

/// Current index format version.
pub const INDEX_VERSION: u32 = 0x3000;

/// Store metadata persisted in the index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMeta {
    /// History page size.
    pub history_page_size: Duration,
}

impl StoreMeta {
    /// Encodes the header record.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&INDEX_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&INDEX_VERSION.to_be_bytes());
        let nanos = u64::try_from(self.history_page_size.as_nanos()).unwrap_or(u64::MAX);
        buf[12..20].copy_from_slice(&nanos.to_be_bytes());
        buf
    }

    /// Decodes and validates the header record.
    ///
    /// # Errors
    ///
    /// Returns `Format` on a magic or version mismatch, or if the history
    /// page size is below the minimum.
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> CoreResult<Self> {
        let magic = u64::from_be_bytes(array(&buf[0..8]));
        if magic != INDEX_MAGIC {
            return Err(CoreError::format(format!("bad index magic {magic:#018x}")));
        }
        let version = u32::from_be_bytes(array(&buf[8..12]));
        if version != INDEX_VERSION {
            return Err(CoreError::format(format!(
                "unsupported index version {version:#x} (expected {INDEX_VERSION:#x})"
            )));
        }

        let history_page_size = Duration::from_nanos(u64::from_be_bytes(array(&buf[12..20])));
        if history_page_size < crate::config::MIN_HISTORY_PAGE_SIZE {
            return Err(CoreError::format(format!(
                "history page size {history_page_size:?} below minimum"
            )));
        }
        Ok(Self { history_page_size })
    }
}

/// The persisted fields of one blob.
///
/// For a tombstone `page` is `None`. Tombstones decoded from disk carry an
/// empty `meta` and a handle with generation zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    /// Blob handle.
    pub handle: Handle,
    /// Metadata bytes.
    pub meta: Vec<u8>,
    /// Version stamp.
    pub version: u64,
    /// Payload location, `None` for a tombstone.
    pub page: Option<PageRef>,
}

impl BlobRecord {
    /// Returns true for a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.page.is_none()
    }

    /// Encodes the record.
    ///
    /// Tombstones are written with generation zero and only the version.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[38..46].copy_from_slice(&self.version.to_be_bytes());

        if let Some(page) = self.page {
            let meta_len = self.meta.len().min(MAX_META_SIZE);
            buf[0..4].copy_from_slice(&self.handle.generation().to_be_bytes());
            buf[5] = meta_len as u8;
            buf[6..6 + meta_len].copy_from_slice(&self.meta[..meta_len]);
            buf[46..50].copy_from_slice(&page.size.to_be_bytes());
            buf[50..54].copy_from_slice(&page.addr.file_id.to_be_bytes());
            buf[54..56].copy_from_slice(&(page.addr.page_id as u16).to_be_bytes());
        }
        buf
    }

    /// Decodes the record for `slot`.
    ///
    /// Returns `None` for a never-used slot.
    ///
    /// # Errors
    ///
    /// Returns `Format` if the metadata length or size is out of range.
    pub fn decode(slot: u32, buf: &[u8; RECORD_SIZE]) -> CoreResult<Option<Self>> {
        let generation = u32::from_be_bytes(array(&buf[0..4]));
        let version = u64::from_be_bytes(array(&buf[38..46]));

        if generation == 0 {
            if version == 0 {
                return Ok(None);
            }
            return Ok(Some(Self {
                handle: Handle::new(0, slot),
                meta: Vec::new(),
                version,
                page: None,
            }));
        }

        let meta_len = buf[5] as usize;
        if meta_len > MAX_META_SIZE {
            return Err(CoreError::format(format!(
                "slot {slot}: meta length {meta_len} exceeds {MAX_META_SIZE}"
            )));
        }
        let size = u32::from_be_bytes(array(&buf[46..50]));
        if size > MAX_PAGE_SIZE {
            return Err(CoreError::format(format!("slot {slot}: size {size} too large")));
        }
        let file_id = u32::from_be_bytes(array(&buf[50..54]));
        let page_id = u32::from(u16::from_be_bytes(array(&buf[54..56])));

        Ok(Some(Self {
            handle: Handle::new(generation, slot),
            meta: buf[6..6 + meta_len].to_vec(),
            version,
            page: Some(PageRef::new(PageAddr::new(file_id, page_id), size)),
        }))
    }

    fn into_blob(self) -> Blob {
        Blob::new(
            self.handle,
            BlobState {
                meta: self.meta,
                version: self.version,
                page: self.page,
            },
        )
    }
}

/// Copies a slice of known length into an array.
fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

fn record_offset(slot: u32) -> u64 {
    (u64::from(slot) + 1) * RECORD_SIZE as u64
}

/// Point-in-time copy of the index used by backup.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    /// Store metadata (the header record).
    pub meta: StoreMeta,
    /// One entry per slot, `None` for empty slots.
    pub slots: Vec<Option<BlobRecord>>,
}

impl IndexSnapshot {
    /// Number of active blobs in the snapshot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|r| !r.is_deleted())
            .count()
    }
}

struct IndexState {
    table: HandleTable,
    version: u64,
}

impl IndexState {
    /// Picks the version for the next record without committing it.
    fn stamp(&self, supplied: Option<u64>) -> CoreResult<u64> {
        match supplied {
            Some(0) => Err(CoreError::invalid_state("version 0 is reserved")),
            Some(v) => Ok(v),
            None => self
                .version
                .checked_add(1)
                .ok_or_else(|| CoreError::limit_exceeded("version counter rolled over")),
        }
    }

    fn commit_version(&mut self, version: u64) {
        self.version = self.version.max(version);
    }
}

/// The on-disk handle index and its in-memory mirror.
///
/// A single lock covers handle allocation, version stamping, blob field
/// updates and record writes, so the file and the table never disagree.
///
/// Callers must not free a blob's previous page until [`write`](Self::write)
/// or [`delete`](Self::delete) has returned: the record pointing at the new
/// location is on disk first.
pub struct DurableIndex {
    backend: Box<dyn StorageBackend>,
    pages: Arc<PageManager>,
    meta: StoreMeta,
    state: Mutex<IndexState>,
}

impl DurableIndex {
    /// Opens an index, creating the header if the backend is empty, and
    /// replays every record into the handle table and page bitmaps.
    ///
    /// # Errors
    ///
    /// Returns `Format` for a bad header or a record that references pages
    /// which don't exist or are claimed twice.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        pages: Arc<PageManager>,
        meta: StoreMeta,
        initial_capacity: usize,
        max_blobs: usize,
    ) -> CoreResult<Self> {
        let size = backend.size()?;
        if size < RECORD_SIZE as u64 {
            backend.write_at(0, &meta.encode())?;
            debug!("created index header");
            return Ok(Self {
                backend,
                pages,
                meta,
                state: Mutex::new(IndexState {
                    table: HandleTable::new(initial_capacity, max_blobs),
                    version: 0,
                }),
            });
        }

        let mut bytes = vec![0u8; size as usize];
        backend.read_at(0, &mut bytes)?;
        let meta = StoreMeta::decode(&array(&bytes[..RECORD_SIZE]))?;

        let body = &bytes[RECORD_SIZE..];
        let trailing = body.len() % RECORD_SIZE;
        if trailing != 0 {
            warn!(bytes = trailing, "ignoring partial record at end of index");
        }
        let records = body.len() / RECORD_SIZE;

        let mut table = HandleTable::new(records.max(initial_capacity), max_blobs);
        let mut version = 0;
        for (slot, chunk) in body.chunks_exact(RECORD_SIZE).enumerate() {
            let Some(record) = BlobRecord::decode(slot as u32, &array(chunk))? else {
                continue;
            };
            if let Some(page) = record.page {
                let page_size = pages.page_size(page.addr.file_id).map_err(|_| {
                    CoreError::format(format!(
                        "slot {slot}: unknown page file {}",
                        page.addr.file_id
                    ))
                })?;
                if page.size > page_size {
                    return Err(CoreError::format(format!(
                        "slot {slot}: size {} exceeds page size {page_size}",
                        page.size
                    )));
                }
                pages.mark_used(page.addr)?;
            }
            version = version.max(record.version);
            table.set(Arc::new(record.into_blob()))?;
        }
        table.reset_cursor();

        debug!(
            records,
            active = table.len(),
            deleted = table.deleted_len(),
            version,
            "replayed index"
        );
        Ok(Self {
            backend,
            pages,
            meta,
            state: Mutex::new(IndexState { table, version }),
        })
    }

    /// Returns the store metadata from the header.
    #[must_use]
    pub fn meta(&self) -> StoreMeta {
        self.meta
    }

    /// Creates a blob whose payload is already written at `page`.
    ///
    /// `page` must have been allocated and written by the caller outside
    /// this lock. If the record cannot be written the page is released
    /// again.
    pub fn create(&self, meta: &[u8], page: PageRef) -> CoreResult<Arc<Blob>> {
        check_meta(meta)?;
        let mut state = self.state.lock();
        let stamped = match state.stamp(None) {
            Ok(version) => state.table.alloc_handle().map(|handle| (handle, version)),
            Err(e) => Err(e),
        };
        let record = match stamped {
            Ok((handle, version)) => BlobRecord {
                handle,
                meta: meta.to_vec(),
                version,
                page: Some(page),
            },
            Err(e) => {
                drop(state);
                self.pages.free(page.addr)?;
                return Err(e);
            }
        };

        if let Err(e) = self.write_record(&record) {
            drop(state);
            self.pages.free(page.addr)?;
            return Err(e);
        }
        state.commit_version(record.version);

        let blob = Arc::new(record.into_blob());
        state.table.set(Arc::clone(&blob))?;
        Ok(blob)
    }

    /// Stamps a new version on an active blob and persists its new fields.
    ///
    /// `meta` replaces the metadata when given; `page` replaces the payload
    /// location when given. `version` is used as is when supplied (push
    /// writes) instead of the next counter value.
    ///
    /// Returns the blob's previous location.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the blob is deleted or no longer in the
    /// table; the in-memory fields are only updated once the record is on
    /// disk.
    pub fn write(
        &self,
        blob: &Arc<Blob>,
        meta: Option<&[u8]>,
        page: Option<PageRef>,
        version: Option<u64>,
    ) -> CoreResult<PageRef> {
        if let Some(meta) = meta {
            check_meta(meta)?;
        }
        let mut state = self.state.lock();
        if !state.table.holds(blob) {
            return Err(CoreError::unknown_handle(blob.handle()));
        }

        let old = blob.state();
        let previous = old
            .page
            .ok_or_else(|| CoreError::unknown_handle(blob.handle()))?;
        let new = BlobState {
            meta: meta.map_or(old.meta, <[u8]>::to_vec),
            version: state.stamp(version)?,
            page: Some(page.unwrap_or(previous)),
        };

        self.write_record(&BlobRecord {
            handle: blob.handle(),
            meta: new.meta.clone(),
            version: new.version,
            page: new.page,
        })?;
        state.commit_version(new.version);
        blob.set_state(new);
        Ok(previous)
    }

    /// Tombstones a blob and returns the page it occupied.
    ///
    /// Metadata and stash stay on the in-memory blob; the record on disk
    /// keeps only the version.
    pub fn delete(&self, blob: &Arc<Blob>, version: Option<u64>) -> CoreResult<PageRef> {
        let mut state = self.state.lock();
        if !state.table.holds(blob) {
            return Err(CoreError::unknown_handle(blob.handle()));
        }

        let old = blob.state();
        let previous = old
            .page
            .ok_or_else(|| CoreError::unknown_handle(blob.handle()))?;
        let new = BlobState {
            meta: old.meta,
            version: state.stamp(version)?,
            page: None,
        };

        self.write_record(&BlobRecord {
            handle: blob.handle(),
            meta: Vec::new(),
            version: new.version,
            page: None,
        })?;
        state.commit_version(new.version);
        blob.set_state(new);
        state.table.free(blob)?;
        Ok(previous)
    }

    /// Looks up an active blob.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<Arc<Blob>> {
        self.state.lock().table.get(handle)
    }

    /// Looks up an active blob, failing with `UnknownHandle`.
    pub fn get_checked(&self, handle: Handle) -> CoreResult<Arc<Blob>> {
        self.state.lock().table.get_checked(handle)
    }

    /// Looks up the tombstone in a handle's slot.
    #[must_use]
    pub fn deleted_get(&self, handle: Handle) -> Option<Arc<Blob>> {
        self.state.lock().table.deleted_get(handle)
    }

    /// Returns true if `blob` is the live occupant of its slot.
    #[must_use]
    pub fn holds(&self, blob: &Arc<Blob>) -> bool {
        self.state.lock().table.holds(blob)
    }

    /// Active blobs in slot order.
    #[must_use]
    pub fn active(&self) -> Vec<Arc<Blob>> {
        let state = self.state.lock();
        state
            .table
            .iter()
            .filter(|b| !b.is_deleted())
            .cloned()
            .collect()
    }

    /// Tombstones in slot order.
    #[must_use]
    pub fn deleted(&self) -> Vec<Arc<Blob>> {
        let state = self.state.lock();
        state
            .table
            .iter()
            .filter(|b| b.is_deleted())
            .cloned()
            .collect()
    }

    /// Number of active blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Returns true if there are no active blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones.
    #[must_use]
    pub fn deleted_len(&self) -> usize {
        self.state.lock().table.deleted_len()
    }

    /// Highest version stamped so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Deep copy of every slot, taken under the index lock.
    #[must_use]
    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.lock();
        IndexSnapshot {
            meta: self.meta,
            slots: state
                .table
                .slots()
                .iter()
                .map(|slot| slot.as_ref().map(|b| b.record()))
                .collect(),
        }
    }

    /// Returns true if the index file has unsynced writes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.backend.is_dirty()
    }

    /// Syncs the index file.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Closes the index file.
    pub fn close(&self) -> CoreResult<()> {
        self.backend.close()?;
        Ok(())
    }

    fn write_record(&self, record: &BlobRecord) -> CoreResult<()> {
        self.backend
            .write_at(record_offset(record.handle.slot()), &record.encode())?;
        Ok(())
    }
}

/// Checks the metadata length limit.
pub(crate) fn check_meta(meta: &[u8]) -> CoreResult<()> {
    if meta.len() > MAX_META_SIZE {
        return Err(CoreError::limit_exceeded(format!(
            "meta size {} exceeds {MAX_META_SIZE}",
            meta.len()
        )));
    }
    Ok(())
}
