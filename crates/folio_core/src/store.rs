//! Store facade.

use crate::backup::{self, BackupMonitor};
use crate::blob::Blob;
use crate::config::{BackupOptions, StoreConfig};
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::index::{check_meta, DurableIndex, StoreMeta};
use crate::page::{PageClassStats, PageManager, MAX_PAGE_SIZE};
use crate::types::{Handle, PageAddr, PageRef};
use folio_storage::{FlushMode, RawFile, SyncPolicy};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Callback invoked with an I/O error from a live write before it is
/// returned to the caller.
pub type WriteErrorHook = Arc<dyn Fn(&CoreError) + Send + Sync>;

/// An open blob store.
///
/// `Store` is the entry point to the engine. It:
/// - Locks the directory against other processes
/// - Replays the index to rebuild handles and page bitmaps
/// - Creates, reads, writes, appends and deletes blobs
/// - Runs online backups
///
/// # Example
///
/// ```rust,no_run
/// use folio_core::{Store, StoreConfig};
/// use std::path::Path;
///
/// let store = Store::open(Path::new("my_store"), StoreConfig::default())?;
/// let blob = store.create(b"meta", b"hello")?;
/// store.append(&blob, None, b" world")?;
/// assert_eq!(store.read(&blob)?, b"hello world");
/// store.close()?;
/// # Ok::<(), folio_core::CoreError>(())
/// ```
///
/// # Concurrency
///
/// All methods take `&self`. Mutations of one blob are serialized by that
/// blob's own lock; different blobs proceed in parallel and only meet at
/// the index lock while their record is stamped. `close` must not race
/// with in-flight operations.
pub struct Store {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(crate) root: PathBuf,
    dir: Mutex<Option<StoreDir>>,
    pub(crate) pages: Arc<PageManager>,
    pub(crate) index: DurableIndex,
    policy: SyncPolicy,
    closed: AtomicBool,
    read_only: AtomicBool,
    pub(crate) backup: Mutex<Option<Arc<BackupMonitor>>>,
    write_error_hook: RwLock<Option<WriteErrorHook>>,
}

impl Store {
    /// Opens (or creates) the store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid (`InvalidConfig`)
    /// - Another process has the store open (`Locked`)
    /// - The index or page files are inconsistent (`Format`)
    /// - I/O errors occur
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let policy = SyncPolicy::new(config.flush_mode);

        let page_files = dir.page_files()?;
        let pages = Arc::new(PageManager::open(path, &page_files, policy.clone())?);
        let index = DurableIndex::open(
            Box::new(RawFile::open(&dir.index_path(), policy.clone())?),
            Arc::clone(&pages),
            StoreMeta {
                history_page_size: config.history_page_size,
            },
            config.initial_capacity,
            config.max_blobs,
        )?;

        info!(
            path = %path.display(),
            blobs = index.len(),
            page_files = pages.file_count(),
            flush_mode = %config.flush_mode,
            read_only = config.read_only,
            "opened store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                root: path.to_path_buf(),
                dir: Mutex::new(Some(dir)),
                pages,
                index,
                policy,
                closed: AtomicBool::new(false),
                read_only: AtomicBool::new(config.read_only),
                backup: Mutex::new(None),
                write_error_hook: RwLock::new(None),
            }),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    /// History page size recorded in the index header.
    #[must_use]
    pub fn history_page_size(&self) -> Duration {
        self.inner.index.meta().history_page_size
    }

    // ==================== Blob operations ====================

    /// Creates a blob.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` if `meta` is longer than 32 bytes or `data`
    /// is larger than 1 MiB, and `InvalidState` on a closed or read-only
    /// store.
    pub fn create(&self, meta: &[u8], data: &[u8]) -> CoreResult<Arc<Blob>> {
        self.inner.check_open()?;
        self.inner.check_writable()?;
        check_meta(meta)?;

        let result = self
            .inner
            .write_page(data)
            .and_then(|page| self.inner.index.create(meta, page));
        self.inner.report(result)
    }

    /// Looks up an active blob.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if no active blob has this exact handle.
    pub fn blob(&self, handle: Handle) -> CoreResult<Arc<Blob>> {
        self.inner.check_open()?;
        self.inner.index.get_checked(handle)
    }

    /// Looks up the tombstone in a handle's slot, if any.
    #[must_use]
    pub fn deleted_blob(&self, handle: Handle) -> Option<Arc<Blob>> {
        self.inner.index.deleted_get(handle)
    }

    /// Reads a blob's payload.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the blob is deleted and `InvalidState` if
    /// the store is closed.
    pub fn read(&self, blob: &Arc<Blob>) -> CoreResult<Vec<u8>> {
        let _guard = blob.lock();
        self.inner.check_open()?;
        let page = live_page(blob)?;
        self.inner.pages.read(page.addr, page.size)
    }

    /// Replaces a blob's metadata and/or payload.
    ///
    /// With `data` the payload moves to a freshly allocated page; the old
    /// page is released only after the index points at the new one. With
    /// `expected_version`, the write fails with `ConcurrentWrite` unless the
    /// blob is still at that version.
    pub fn write(
        &self,
        blob: &Arc<Blob>,
        meta: Option<&[u8]>,
        data: Option<&[u8]>,
        expected_version: Option<u64>,
    ) -> CoreResult<()> {
        let _guard = blob.lock();
        self.inner.check_write(blob)?;
        if let Some(expected) = expected_version {
            let current = blob.version();
            if current != expected {
                return Err(CoreError::ConcurrentWrite { current, expected });
            }
        }
        let result = self.inner.write_locked(blob, meta, data, None);
        self.inner.report(result)
    }

    /// Appends bytes to a blob's payload.
    ///
    /// While the grown payload still fits the current page, the bytes are
    /// written in place at the payload's tail and the page stays the same.
    /// Otherwise the payload is read, merged and written to a page of a
    /// larger size class.
    pub fn append(&self, blob: &Arc<Blob>, meta: Option<&[u8]>, data: &[u8]) -> CoreResult<()> {
        let _guard = blob.lock();
        self.inner.check_write(blob)?;
        let result = self.inner.append_locked(blob, meta, data);
        self.inner.report(result)
    }

    /// Deletes a blob, leaving a tombstone, and releases its page.
    pub fn delete(&self, blob: &Arc<Blob>) -> CoreResult<()> {
        let _guard = blob.lock();
        self.inner.check_write(blob)?;
        let result = self.inner.delete_locked(blob, None);
        self.inner.report(result)
    }

    /// Applies a replicated write carrying its own version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the store is read-only.
    pub fn push_write(
        &self,
        blob: &Arc<Blob>,
        meta: Option<&[u8]>,
        data: Option<&[u8]>,
        version: u64,
    ) -> CoreResult<()> {
        let _guard = blob.lock();
        self.inner.check_push(blob)?;
        let result = self.inner.write_locked(blob, meta, data, Some(version));
        self.inner.report(result)
    }

    /// Applies a replicated delete carrying its own version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the store is read-only.
    pub fn push_delete(&self, blob: &Arc<Blob>, version: u64) -> CoreResult<()> {
        let _guard = blob.lock();
        self.inner.check_push(blob)?;
        let result = self.inner.delete_locked(blob, Some(version));
        self.inner.report(result)
    }

    // ==================== Enumeration ====================

    /// Calls `f` for every active blob in slot order.
    pub fn each<F: FnMut(&Arc<Blob>)>(&self, f: F) {
        self.inner.index.active().iter().for_each(f);
    }

    /// Returns all active blobs in slot order.
    #[must_use]
    pub fn blobs(&self) -> Vec<Arc<Blob>> {
        self.inner.index.active()
    }

    /// Calls `f` for every tombstone in slot order.
    pub fn deleted_each<F: FnMut(&Arc<Blob>)>(&self, f: F) {
        self.inner.index.deleted().iter().for_each(f);
    }

    /// Returns all tombstones in slot order.
    #[must_use]
    pub fn deleted_blobs(&self) -> Vec<Arc<Blob>> {
        self.inner.index.deleted()
    }

    // ==================== Statistics ====================

    /// Number of active blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    /// Returns true if the store holds no active blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones.
    #[must_use]
    pub fn deleted_len(&self) -> usize {
        self.inner.index.deleted_len()
    }

    /// Highest version stamped so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.index.version()
    }

    /// Number of page files.
    #[must_use]
    pub fn page_file_count(&self) -> usize {
        self.inner.pages.file_count()
    }

    /// Page usage per size class.
    #[must_use]
    pub fn page_distribution(&self) -> Vec<PageClassStats> {
        self.inner.pages.distribution()
    }

    /// Number of files (index and pages) with unsynced writes.
    #[must_use]
    pub fn unflushed_count(&self) -> usize {
        usize::from(self.inner.index.is_dirty()) + self.inner.pages.dirty_count()
    }

    /// Number of GC freezes currently held.
    #[must_use]
    pub fn gc_freeze_count(&self) -> u32 {
        self.inner.pages.freeze_count()
    }

    /// Returns true if the page is allocated.
    #[must_use]
    pub fn is_page_used(&self, file_id: u32, page_id: u32) -> bool {
        self.inner.pages.is_used(PageAddr::new(file_id, page_id))
    }

    /// One human-readable line per page file.
    #[must_use]
    pub fn debug_files(&self) -> Vec<String> {
        self.inner.pages.debug_lines()
    }

    // ==================== Modes and hooks ====================

    /// Returns true if mutations are rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::SeqCst)
    }

    /// Switches read-only mode at runtime.
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns the current flush mode.
    #[must_use]
    pub fn flush_mode(&self) -> FlushMode {
        self.inner.policy.mode()
    }

    /// Switches every open file between strict and deferred sync.
    pub fn set_flush_mode(&self, mode: FlushMode) {
        self.inner.policy.set_mode(mode);
    }

    /// Registers the hook called on I/O failures of live writes.
    pub fn set_write_error_hook(&self, hook: Option<WriteErrorHook>) {
        *self.inner.write_error_hook.write() = hook;
    }

    /// Makes page writes fail as if the disk were full (testing only).
    pub fn set_test_disk_full(&self, full: bool) {
        self.inner.pages.set_test_disk_full(full);
    }

    // ==================== Backup ====================

    /// Starts a backup into a compressed archive at `archive`.
    ///
    /// Returns immediately; the backup runs on its own thread and reports
    /// through the returned monitor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the store is closed or another backup is
    /// still running.
    pub fn backup(&self, archive: &Path, options: BackupOptions) -> CoreResult<Arc<BackupMonitor>> {
        self.inner.check_open()?;
        backup::start(&self.inner, archive, options)
    }

    /// Returns the running backup's monitor, if any.
    #[must_use]
    pub fn backup_monitor(&self) -> Option<Arc<BackupMonitor>> {
        self.inner.backup.lock().clone()
    }

    // ==================== Lifecycle ====================

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Syncs every dirty file.
    pub fn flush(&self) -> CoreResult<()> {
        self.inner.check_open()?;
        self.inner.pages.flush()?;
        self.inner.index.flush()
    }

    /// Syncs and closes all files and releases the directory lock.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> CoreResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .inner
            .pages
            .close()
            .and_then(|()| self.inner.index.close());
        self.inner.dir.lock().take();
        info!(path = %self.inner.root.display(), "closed store");
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.root)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn live_page(blob: &Blob) -> CoreResult<PageRef> {
    blob.state()
        .page
        .ok_or_else(|| CoreError::unknown_handle(blob.handle()))
}

impl StoreInner {
    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::store_closed());
        }
        Ok(())
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(CoreError::store_read_only());
        }
        Ok(())
    }

    fn check_write(&self, blob: &Blob) -> CoreResult<()> {
        self.check_open()?;
        live_page(blob)?;
        self.check_writable()
    }

    fn check_push(&self, blob: &Blob) -> CoreResult<()> {
        self.check_open()?;
        live_page(blob)?;
        if !self.read_only.load(Ordering::SeqCst) {
            return Err(CoreError::invalid_state("push requires a readonly store"));
        }
        Ok(())
    }

    /// Fires the write-error hook for I/O failures, then passes the result on.
    fn report<T>(&self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(e) = &result {
            if e.is_io() {
                error!(error = %e, "blob write failed");
                let hook = self.write_error_hook.read().clone();
                if let Some(hook) = hook {
                    hook(e);
                }
            }
        }
        result
    }

    /// Allocates a page for `data` and writes it, releasing the page again
    /// if the write fails.
    fn write_page(&self, data: &[u8]) -> CoreResult<PageRef> {
        let addr = self.pages.alloc(data.len())?;
        if let Err(e) = self.pages.write(addr, 0, data) {
            self.pages.free(addr)?;
            return Err(e);
        }
        Ok(PageRef::new(addr, data.len() as u32))
    }

    fn write_locked(
        &self,
        blob: &Arc<Blob>,
        meta: Option<&[u8]>,
        data: Option<&[u8]>,
        version: Option<u64>,
    ) -> CoreResult<()> {
        if let Some(meta) = meta {
            check_meta(meta)?;
        }
        let new_page = data.map(|d| self.write_page(d)).transpose()?;

        let previous = match self.index.write(blob, meta, new_page, version) {
            Ok(previous) => previous,
            Err(e) => {
                if let Some(page) = new_page {
                    self.pages.free(page.addr)?;
                }
                return Err(e);
            }
        };

        // the index now points at the new page; the old one can go
        if new_page.is_some() {
            self.pages.free(previous.addr)?;
        }
        Ok(())
    }

    fn append_locked(&self, blob: &Arc<Blob>, meta: Option<&[u8]>, data: &[u8]) -> CoreResult<()> {
        if let Some(meta) = meta {
            check_meta(meta)?;
        }
        let current = live_page(blob)?;
        let new_size = current.size as usize + data.len();
        if new_size > MAX_PAGE_SIZE as usize {
            return Err(CoreError::limit_exceeded(format!(
                "append would grow blob {} to {new_size} bytes",
                blob.handle()
            )));
        }

        let page_size = self.pages.page_size(current.addr.file_id)?;
        if new_size > page_size as usize {
            let mut merged = self.pages.read(current.addr, current.size)?;
            merged.extend_from_slice(data);
            return self.write_locked(blob, meta, Some(&merged), None);
        }

        self.pages.write(current.addr, current.size, data)?;
        self.index.write(
            blob,
            meta,
            Some(PageRef::new(current.addr, new_size as u32)),
            None,
        )?;
        Ok(())
    }

    fn delete_locked(&self, blob: &Arc<Blob>, version: Option<u64>) -> CoreResult<()> {
        let previous = self.index.delete(blob, version)?;
        self.pages.free(previous.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BlobRecord, RECORD_SIZE};
    use tempfile::tempdir;

    #[test]
    fn old_page_freed_only_after_index_points_elsewhere() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path(), StoreConfig::default()).unwrap();
        let blob = store.create(b"m", b"first payload").unwrap();
        let slot = blob.handle().slot();
        let index_path = temp.path().join(crate::dir::INDEX_FILE);

        let violations = Arc::new(Mutex::new(Vec::new()));
        let frees = Arc::new(Mutex::new(0usize));
        {
            let violations = Arc::clone(&violations);
            let frees = Arc::clone(&frees);
            store.inner.pages.set_free_hook(Some(Arc::new(move |addr: PageAddr| {
                *frees.lock() += 1;
                let bytes = std::fs::read(&index_path).unwrap();
                let offset = (slot as usize + 1) * RECORD_SIZE;
                let mut record = [0u8; RECORD_SIZE];
                record.copy_from_slice(&bytes[offset..offset + RECORD_SIZE]);
                let on_disk = BlobRecord::decode(slot, &record).unwrap().unwrap();
                if on_disk.page.map(|p| p.addr) == Some(addr) {
                    violations.lock().push(addr);
                }
            })));
        }

        store
            .write(&blob, None, Some(b"second payload, a bit longer"), None)
            .unwrap();
        store.append(&blob, None, &[7u8; 40]).unwrap();
        store.delete(&blob).unwrap();

        assert_eq!(*frees.lock(), 3);
        assert!(violations.lock().is_empty(), "freed pages still indexed: {:?}", violations.lock());
    }

    #[test]
    fn failed_page_write_releases_page() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path(), StoreConfig::default()).unwrap();
        let blob = store.create(b"", b"payload").unwrap();
        let page = blob.page().unwrap();

        store.set_test_disk_full(true);
        assert!(store.write(&blob, None, Some(b"new payload"), None).is_err());
        store.set_test_disk_full(false);

        // the page allocated for the failed write went straight back
        assert!(store.is_page_used(page.file_id, page.page_id));
        assert!(!store.is_page_used(page.file_id, page.page_id + 1));
        assert_eq!(store.read(&blob).unwrap(), b"payload");
    }
}
