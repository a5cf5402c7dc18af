//! Online backup.
//!
//! A backup runs on its own thread while the store stays fully usable:
//!
//! 1. List the auxiliary files in the store directory
//! 2. Freeze page frees (GC freeze)
//! 3. Snapshot every index slot
//! 4. Write `backup-meta.props`
//! 5. Repack the snapshot's pages, class by class, into fresh page files
//! 6. Write the index re-encoded for the repacked layout
//! 7. Copy the auxiliary files
//! 8. Finish the archive, unfreeze, signal completion
//!
//! The freeze keeps every page the snapshot references from being reused
//! until the backup is done, so no page data needs to be copied up front.

mod archive;
mod monitor;
mod restore;

pub use archive::{ArchiveEntry, ArchiveReader, ArchiveWriter};
pub use monitor::{
    BackupCompletionHandler, BackupFuture, BackupMonitor, BackupResult, BackupState,
};
pub use restore::restore;

use crate::config::BackupOptions;
use crate::dir::{self, INDEX_FILE};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexSnapshot, RECORD_SIZE};
use crate::page::{class_range, page_file_name, size_classes, PAGES_PER_FILE};
use crate::store::StoreInner;
use crate::types::{PageAddr, PageRef};
use archive::ARCHIVE_VERSION;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use sysinfo::System;
use tracing::{error, info, warn};

/// Name of the metadata entry at the start of every archive.
pub const META_ENTRY: &str = "backup-meta.props";

/// Index records buffered before they are handed to the archive.
const INDEX_RECORDS_PER_WRITE: usize = 1024;

/// Starts a backup thread unless one is already running.
pub(crate) fn start(
    inner: &Arc<StoreInner>,
    archive: &Path,
    options: BackupOptions,
) -> CoreResult<Arc<BackupMonitor>> {
    let monitor = Arc::new(BackupMonitor::new(archive, options.future_result.clone()));
    {
        let mut slot = inner.backup.lock();
        if slot.as_ref().is_some_and(|running| !running.is_complete()) {
            return Err(CoreError::invalid_state("backup already running"));
        }
        *slot = Some(Arc::clone(&monitor));
    }

    let task = {
        let inner = Arc::clone(inner);
        let monitor = Arc::clone(&monitor);
        let archive = archive.to_path_buf();
        move || run(&inner, &monitor, &archive, &options)
    };
    if let Err(e) = thread::Builder::new()
        .name("folio-backup".to_string())
        .spawn(task)
    {
        inner.backup.lock().take();
        return Err(e.into());
    }
    Ok(monitor)
}

fn run(inner: &StoreInner, monitor: &Arc<BackupMonitor>, archive: &Path, options: &BackupOptions) {
    monitor.begin();
    info!(archive = %archive.display(), "backup started");

    let result = write_backup(inner, monitor, archive, options);
    match &result {
        Ok(()) => info!(archive = %archive.display(), "backup finished"),
        Err(e) => {
            error!(archive = %archive.display(), error = %e, "backup failed");
            if archive.is_file() {
                if let Err(remove) = fs::remove_file(archive) {
                    warn!(error = %remove, "could not remove partial backup");
                }
            }
        }
    }

    {
        let mut slot = inner.backup.lock();
        if slot.as_ref().is_some_and(|m| Arc::ptr_eq(m, monitor)) {
            slot.take();
        }
    }
    monitor.complete(result);
}

fn write_backup(
    inner: &StoreInner,
    monitor: &BackupMonitor,
    archive: &Path,
    options: &BackupOptions,
) -> CoreResult<()> {
    let aux: Vec<String> = dir::aux_files(&inner.root)?
        .into_iter()
        .filter(|name| inner.root.join(name) != archive)
        .collect();

    inner.pages.gc_freeze();
    let result = write_frozen(inner, monitor, archive, options, &aux);
    let unfrozen = inner.pages.gc_unfreeze();
    result.and(unfrozen)
}

fn write_frozen(
    inner: &StoreInner,
    monitor: &BackupMonitor,
    archive: &Path,
    options: &BackupOptions,
    aux: &[String],
) -> CoreResult<()> {
    let mut snapshot = inner.index.snapshot();

    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(archive)?;
    let mut writer = ArchiveWriter::new(BufWriter::new(file), &options.path_prefix)?;
    writer.add_entry(META_ENTRY, meta_props(&inner.root, &snapshot).as_bytes())?;

    if let Some(delay) = options.test_delay {
        thread::sleep(delay);
    }

    let mut progress = Progress {
        monitor,
        done: 0,
        total: snapshot.active_count() + aux.len(),
    };
    write_pages(inner, &mut writer, &mut snapshot, &mut progress)?;
    write_index(&mut writer, &snapshot)?;
    write_aux(&inner.root, &mut writer, aux, &mut progress)?;

    let file = writer
        .finish()?
        .into_inner()
        .map_err(|e| CoreError::from(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

struct Progress<'a> {
    monitor: &'a BackupMonitor,
    done: usize,
    total: usize,
}

impl Progress<'_> {
    fn step(&mut self) {
        self.done += 1;
        self.monitor.set_progress(self.done, self.total);
    }
}

fn meta_props(root: &Path, snapshot: &IndexSnapshot) -> String {
    format!(
        "version={ARCHIVE_VERSION}\nts={}\nfile={}\nplatform={}-{}\nhost={}\nindexSize={}\n",
        Utc::now().to_rfc3339(),
        root.display(),
        std::env::consts::OS,
        std::env::consts::ARCH,
        System::host_name().unwrap_or_default(),
        snapshot.slots.len(),
    )
}

/// Copies every snapshot page into backup-local page files and points the
/// snapshot records at their new coordinates.
///
/// Classes are walked smallest first; backup file ids are handed out
/// sequentially from 0 and a new file starts every [`PAGES_PER_FILE`] pages.
fn write_pages<W: Write>(
    inner: &StoreInner,
    writer: &mut ArchiveWriter<W>,
    snapshot: &mut IndexSnapshot,
    progress: &mut Progress<'_>,
) -> CoreResult<()> {
    let mut next_file_id = 0u32;

    for page_size in size_classes() {
        let (min, max) = class_range(page_size);
        let zeros = vec![0u8; page_size as usize];
        // (file id, next page id) of the open backup file of this class
        let mut current: Option<(u32, u32)> = None;

        for record in snapshot.slots.iter_mut().flatten() {
            let Some(page) = record.page else { continue };
            if page.size < min || page.size > max {
                continue;
            }

            let (file_id, page_id) = match current {
                Some((file_id, page_id)) if page_id < PAGES_PER_FILE => (file_id, page_id),
                open => {
                    if open.is_some() {
                        writer.finish_entry()?;
                    }
                    let file_id = next_file_id;
                    next_file_id += 1;
                    writer.start_entry(&page_file_name(file_id, page_size))?;
                    (file_id, 0)
                }
            };

            let data = inner.pages.read(page.addr, page.size)?;
            writer.write(&data)?;
            writer.write(&zeros[data.len()..])?;

            record.page = Some(PageRef::new(PageAddr::new(file_id, page_id), page.size));
            current = Some((file_id, page_id + 1));
            progress.step();
        }

        if current.is_some() {
            writer.finish_entry()?;
        }
    }
    Ok(())
}

/// Writes the snapshot as an index file: the header, then one record per
/// slot, with never-used slots left zeroed.
fn write_index<W: Write>(writer: &mut ArchiveWriter<W>, snapshot: &IndexSnapshot) -> CoreResult<()> {
    writer.start_entry(INDEX_FILE)?;
    writer.write(&snapshot.meta.encode())?;

    let mut buf = Vec::with_capacity(INDEX_RECORDS_PER_WRITE * RECORD_SIZE);
    for chunk in snapshot.slots.chunks(INDEX_RECORDS_PER_WRITE) {
        buf.clear();
        for slot in chunk {
            match slot {
                Some(record) => buf.extend_from_slice(&record.encode()),
                None => buf.extend_from_slice(&[0u8; RECORD_SIZE]),
            }
        }
        writer.write(&buf)?;
    }
    writer.finish_entry()
}

fn write_aux<W: Write>(
    root: &Path,
    writer: &mut ArchiveWriter<W>,
    aux: &[String],
    progress: &mut Progress<'_>,
) -> CoreResult<()> {
    for name in aux {
        let path: PathBuf = root.join(name);
        match fs::read(&path) {
            Ok(data) => writer.add_entry(name, &data)?,
            Err(e) => warn!(file = %path.display(), error = %e, "skipping auxiliary file"),
        }
        progress.step();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::Store;
    use std::time::Duration;
    use tempfile::tempdir;

    fn entries(path: &Path) -> Vec<ArchiveEntry> {
        ArchiveReader::new(File::open(path).unwrap())
            .unwrap()
            .entries()
            .unwrap()
    }

    #[test]
    fn archive_layout() {
        let temp = tempdir().unwrap();
        let store_dir = temp.path().join("store");
        let store = Store::open(&store_dir, StoreConfig::default()).unwrap();
        store.create(b"a", &[1u8; 10]).unwrap();
        store.create(b"b", &[2u8; 100]).unwrap();
        store.create(b"c", &[3u8; 12]).unwrap();
        fs::write(store_dir.join("settings.cfg"), b"k=v").unwrap();

        let archive = temp.path().join("out.zst");
        let monitor = store.backup(&archive, BackupOptions::default()).unwrap();
        monitor.future().wait().unwrap();

        let entries = entries(&archive);
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "db-backup/backup-meta.props",
                "db-backup/data000/data-000-000.p04",
                "db-backup/data000/data-000-001.p07",
                "db-backup/folio.index",
                "db-backup/settings.cfg",
            ]
        );

        // two 16-byte pages, zero padded
        let small = &entries[1].data;
        assert_eq!(small.len(), 32);
        assert_eq!(&small[..10], &[1u8; 10]);
        assert_eq!(&small[10..16], &[0u8; 6]);
        assert_eq!(&small[16..28], &[3u8; 12]);

        let props = String::from_utf8(entries[0].data.clone()).unwrap();
        assert!(props.contains("version=1\n"));
        assert!(props.contains("indexSize="));
        assert_eq!(entries[4].data, b"k=v");
    }

    #[test]
    fn second_backup_rejected_while_running() {
        let temp = tempdir().unwrap();
        let store = Store::open(&temp.path().join("store"), StoreConfig::default()).unwrap();
        store.create(b"", b"x").unwrap();

        let slow = BackupOptions::default().test_delay(Duration::from_millis(200));
        let monitor = store.backup(&temp.path().join("one.zst"), slow).unwrap();
        assert!(store.backup_monitor().is_some());
        assert!(matches!(
            store.backup(&temp.path().join("two.zst"), BackupOptions::default()),
            Err(CoreError::InvalidState { .. })
        ));

        monitor.future().wait().unwrap();
        assert!(store.backup_monitor().is_none());
        let again = store
            .backup(&temp.path().join("two.zst"), BackupOptions::default())
            .unwrap();
        again.future().wait().unwrap();
    }

    #[test]
    fn failed_backup_reports_error_and_unfreezes() {
        let temp = tempdir().unwrap();
        let store = Store::open(&temp.path().join("store"), StoreConfig::default()).unwrap();
        store.create(b"", b"x").unwrap();

        // a directory in the archive's place cannot be opened for writing
        let archive = temp.path().join("taken");
        fs::create_dir(&archive).unwrap();
        let monitor = store.backup(&archive, BackupOptions::default()).unwrap();
        assert!(monitor.future().wait().is_err());
        assert_eq!(monitor.state(), BackupState::Failed);
        assert_eq!(monitor.progress(), 100);
        assert_eq!(store.gc_freeze_count(), 0);
        assert!(archive.is_dir());
    }

    #[test]
    fn missing_archive_directories_are_created() {
        let temp = tempdir().unwrap();
        let store = Store::open(&temp.path().join("store"), StoreConfig::default()).unwrap();
        store.create(b"", b"x").unwrap();

        let archive = temp.path().join("nightly").join("2026").join("out.zst");
        let monitor = store.backup(&archive, BackupOptions::default()).unwrap();
        monitor.future().wait().unwrap();
        assert!(archive.is_file());
    }
}
