//! Page allocation across size-classed page files.

use super::{page_file_name, size_class, PageFile, MAX_PAGE_FILE_ID};
use crate::error::{CoreError, CoreResult};
use crate::types::PageAddr;
use folio_storage::{MemFile, RawFile, StorageBackend, SyncPolicy};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
pub(crate) type FreeHook = Arc<dyn Fn(PageAddr) + Send + Sync>;

/// Per size class usage numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageClassStats {
    /// Page size of the class.
    pub page_size: u32,
    /// Number of page files of this class.
    pub file_count: usize,
    /// Number of allocated pages across those files.
    pub used_pages: u64,
}

/// Owns every page file of a store and hands out pages.
///
/// # Locking
///
/// Allocation, free and freeze bookkeeping run under one manager-wide lock.
/// Page reads and writes only take that lock long enough to look up the
/// file; the I/O itself runs under the file's own lock.
///
/// # GC freeze
///
/// While at least one freeze is held, [`free`](Self::free) queues the page
/// instead of releasing it. The final [`gc_unfreeze`](Self::gc_unfreeze)
/// applies the queued frees in order. A backup relies on this: no page a
/// live blob pointed to when the freeze began can be reallocated and
/// overwritten until the freeze ends.
pub struct PageManager {
    root: Option<PathBuf>,
    policy: SyncPolicy,
    state: Mutex<PageState>,
    disk_full: AtomicBool,
    #[cfg(test)]
    free_hook: Mutex<Option<FreeHook>>,
}

#[derive(Default)]
struct PageState {
    files: Vec<Arc<PageFile>>,
    freeze_count: u32,
    deferred: Vec<PageAddr>,
}

impl PageManager {
    /// Opens the page files of a store directory.
    ///
    /// `existing` lists `(file_id, page_size)` for every page file found on
    /// disk. File ids must be exactly `0..n`.
    ///
    /// # Errors
    ///
    /// Returns `Format` for duplicate or missing file ids, or an I/O error
    /// if a file cannot be opened.
    pub fn open(root: &Path, existing: &[(u32, u32)], policy: SyncPolicy) -> CoreResult<Self> {
        let mut by_id = BTreeMap::new();
        for &(file_id, page_size) in existing {
            if by_id.insert(file_id, page_size).is_some() {
                return Err(CoreError::format(format!(
                    "duplicate page file id {file_id}"
                )));
            }
        }

        if let Some(expected) = by_id
            .keys()
            .enumerate()
            .find_map(|(expected, &file_id)| (file_id as usize != expected).then_some(expected))
        {
            return Err(CoreError::format(format!(
                "missing page file id {expected}"
            )));
        }

        let mut files = Vec::with_capacity(by_id.len());
        for (file_id, page_size) in by_id {
            let path = root.join(page_file_name(file_id, page_size));
            let backend = RawFile::open(&path, policy.clone())?;
            files.push(Arc::new(PageFile::new(file_id, page_size, Box::new(backend))?));
        }

        Ok(Self::with_files(Some(root.to_path_buf()), policy, files))
    }

    /// Creates a manager whose page files live in memory.
    #[must_use]
    pub fn in_memory(policy: SyncPolicy) -> Self {
        Self::with_files(None, policy, Vec::new())
    }

    fn with_files(root: Option<PathBuf>, policy: SyncPolicy, files: Vec<Arc<PageFile>>) -> Self {
        Self {
            root,
            policy,
            state: Mutex::new(PageState {
                files,
                ..PageState::default()
            }),
            disk_full: AtomicBool::new(false),
            #[cfg(test)]
            free_hook: Mutex::new(None),
        }
    }

    /// Allocates a page large enough for `size` bytes.
    ///
    /// Scans the existing files of the matching size class in file id order
    /// and takes the first free page. When every file of the class is full a
    /// new file is created with the next global file id.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` if `size` exceeds the largest page size or if
    /// no file id is left.
    pub fn alloc(&self, size: usize) -> CoreResult<PageAddr> {
        let page_size = size_class(size)?;
        let mut state = self.state.lock();

        for file in state.files.iter().filter(|f| f.page_size() == page_size) {
            if let Some(page_id) = file.bitmap().alloc() {
                return Ok(PageAddr::new(file.file_id(), page_id));
            }
        }

        let file = self.create_file(state.files.len(), page_size)?;
        let page_id = file.bitmap().alloc().ok_or_else(|| {
            CoreError::invalid_state(format!("new page file {} is full", file.file_id()))
        })?;
        let addr = PageAddr::new(file.file_id(), page_id);
        state.files.push(file);
        Ok(addr)
    }

    fn create_file(&self, next_id: usize, page_size: u32) -> CoreResult<Arc<PageFile>> {
        if next_id > MAX_PAGE_FILE_ID as usize {
            return Err(CoreError::limit_exceeded(format!(
                "page file ids exhausted ({MAX_PAGE_FILE_ID} max)"
            )));
        }
        let file_id = next_id as u32;

        let backend: Box<dyn StorageBackend> = match &self.root {
            Some(root) => {
                let path = root.join(page_file_name(file_id, page_size));
                Box::new(RawFile::open_with_create_dirs(&path, self.policy.clone())?)
            }
            None if self.policy.is_deferred() => Box::new(MemFile::deferred()),
            None => Box::new(MemFile::new()),
        };

        debug!(file_id, page_size, "created page file");
        Ok(Arc::new(PageFile::new(file_id, page_size, backend)?))
    }

    /// Returns a page to its file's free pool, or queues it while frozen.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for an unknown file or a page that is already
    /// free.
    pub fn free(&self, addr: PageAddr) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.freeze_count > 0 {
            state.deferred.push(addr);
            return Ok(());
        }
        self.release(&state, addr)
    }

    fn release(&self, state: &PageState, addr: PageAddr) -> CoreResult<()> {
        let file = Self::lookup(state, addr.file_id)?;
        file.bitmap().free(addr.page_id)?;

        #[cfg(test)]
        if let Some(hook) = self.free_hook.lock().as_ref() {
            hook(addr);
        }
        Ok(())
    }

    /// Marks a page used while replaying the index.
    ///
    /// # Errors
    ///
    /// Returns `Format` if the file doesn't exist, the page is out of range
    /// or the page is already claimed by another record.
    pub fn mark_used(&self, addr: PageAddr) -> CoreResult<()> {
        let state = self.state.lock();
        let file = state.files.get(addr.file_id as usize).ok_or_else(|| {
            CoreError::format(format!(
                "record references unknown page file {}",
                addr.file_id
            ))
        })?;
        let marked = file
            .bitmap()
            .mark_used(addr.page_id)
            .map_err(|e| CoreError::format(format!("page {addr}: {e}")));
        marked
    }

    /// Returns the page size of a file.
    pub fn page_size(&self, file_id: u32) -> CoreResult<u32> {
        let state = self.state.lock();
        Ok(Self::lookup(&state, file_id)?.page_size())
    }

    /// Reads the first `len` bytes of a page.
    pub fn read(&self, addr: PageAddr, len: u32) -> CoreResult<Vec<u8>> {
        self.file(addr.file_id)?.read(addr.page_id, len)
    }

    /// Writes `data` into a page at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with an I/O error while the disk-full simulation is on.
    pub fn write(&self, addr: PageAddr, offset: u32, data: &[u8]) -> CoreResult<()> {
        if self.disk_full.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk full (simulated)").into());
        }
        self.file(addr.file_id)?.write(addr.page_id, offset, data)
    }

    /// Makes page writes fail as if the disk were full.
    pub fn set_test_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::SeqCst);
    }

    /// Starts (or nests) a GC freeze.
    pub fn gc_freeze(&self) {
        let mut state = self.state.lock();
        state.freeze_count += 1;
        debug!(count = state.freeze_count, "gc freeze");
    }

    /// Ends one GC freeze, applying queued frees when the last one ends.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no freeze is held, or the first error hit
    /// while applying queued frees.
    pub fn gc_unfreeze(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.freeze_count == 0 {
            return Err(CoreError::invalid_state("gc unfreeze without freeze"));
        }
        state.freeze_count -= 1;
        if state.freeze_count > 0 {
            debug!(count = state.freeze_count, "gc unfreeze (still frozen)");
            return Ok(());
        }

        let deferred = std::mem::take(&mut state.deferred);
        debug!(queued = deferred.len(), "gc unfreeze, applying queued frees");
        for addr in deferred {
            self.release(&state, addr)?;
        }
        Ok(())
    }

    /// Number of freezes currently held.
    #[must_use]
    pub fn freeze_count(&self) -> u32 {
        self.state.lock().freeze_count
    }

    /// Returns true if the page is allocated.
    #[must_use]
    pub fn is_used(&self, addr: PageAddr) -> bool {
        let state = self.state.lock();
        state
            .files
            .get(addr.file_id as usize)
            .is_some_and(|f| f.bitmap().is_used(addr.page_id))
    }

    /// Number of page files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Usage per size class, for classes with at least one file.
    #[must_use]
    pub fn distribution(&self) -> Vec<PageClassStats> {
        let state = self.state.lock();
        let mut by_class: BTreeMap<u32, PageClassStats> = BTreeMap::new();
        for file in &state.files {
            let entry = by_class.entry(file.page_size()).or_insert(PageClassStats {
                page_size: file.page_size(),
                file_count: 0,
                used_pages: 0,
            });
            entry.file_count += 1;
            entry.used_pages += u64::from(file.bitmap().num_used());
        }
        by_class.into_values().collect()
    }

    /// One line per page file.
    #[must_use]
    pub fn debug_lines(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .files
            .iter()
            .map(|f| {
                let bitmap = f.bitmap();
                format!(
                    "{} size={} used={}/{}",
                    page_file_name(f.file_id(), f.page_size()),
                    f.page_size(),
                    bitmap.num_used(),
                    bitmap.capacity()
                )
            })
            .collect()
    }

    /// Number of page files with unsynced writes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.files().iter().filter(|f| f.is_dirty()).count()
    }

    /// Syncs every page file.
    pub fn flush(&self) -> CoreResult<()> {
        for file in self.files() {
            file.flush()?;
        }
        Ok(())
    }

    /// Closes every page file.
    pub fn close(&self) -> CoreResult<()> {
        for file in self.files() {
            file.close()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_free_hook(&self, hook: Option<FreeHook>) {
        *self.free_hook.lock() = hook;
    }

    fn files(&self) -> Vec<Arc<PageFile>> {
        self.state.lock().files.clone()
    }

    fn file(&self, file_id: u32) -> CoreResult<Arc<PageFile>> {
        let state = self.state.lock();
        Self::lookup(&state, file_id).map(Arc::clone)
    }

    fn lookup(state: &PageState, file_id: u32) -> CoreResult<&Arc<PageFile>> {
        state
            .files
            .get(file_id as usize)
            .ok_or_else(|| CoreError::invalid_state(format!("unknown page file {file_id}")))
    }
}

impl std::fmt::Debug for PageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageManager")
            .field("root", &self.root)
            .field("file_count", &self.file_count())
            .field("freeze_count", &self.freeze_count())
            .finish()
    }
}
