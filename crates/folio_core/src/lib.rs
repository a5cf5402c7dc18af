//! # Folio Core
//!
//! Embedded, page-oriented blob store.
//!
//! Every blob has up to 32 bytes of metadata, a payload of up to 1 MiB and
//! a version stamped from a store-wide counter. Payloads live in
//! power-of-two sized pages spread over many page files; a fixed-record
//! index maps handles to pages and is replayed on open.
//!
//! This crate provides:
//! - Size-classed page allocation with per-file free bitmaps
//! - The durable handle index and its generation-checked handle table
//! - Blob create/read/write/append/delete with optimistic versioning
//! - Online backups into a compressed archive, and restore
//!
//! ## Write ordering
//!
//! A blob's new payload is written to a fresh page, then its index record
//! is rewritten, and only then is the old page released. A crash at any
//! point leaves the index pointing at a complete payload.
//!
//! ## Example
//!
//! ```rust,no_run
//! use folio_core::{BackupOptions, Store, StoreConfig};
//! use std::path::Path;
//!
//! let store = Store::open(Path::new("blobs"), StoreConfig::default())?;
//! let blob = store.create(b"v1", b"payload")?;
//! store.write(&blob, None, Some(b"new payload"), Some(blob.version()))?;
//!
//! let monitor = store.backup(Path::new("blobs.zst"), BackupOptions::default())?;
//! monitor.future().wait().ok();
//! # Ok::<(), folio_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
mod blob;
mod config;
pub mod dir;
mod error;
mod handles;
mod index;
pub mod page;
mod store;
mod types;

pub use backup::{
    restore, ArchiveEntry, ArchiveReader, ArchiveWriter, BackupCompletionHandler, BackupFuture,
    BackupMonitor, BackupResult, BackupState,
};
pub use blob::{Blob, Stash, MAX_META_SIZE};
pub use config::{BackupOptions, StoreConfig, DEFAULT_PATH_PREFIX, MIN_HISTORY_PAGE_SIZE};
pub use error::{CoreError, CoreResult};
pub use folio_storage::FlushMode;
pub use handles::HandleTable;
pub use index::{BlobRecord, DurableIndex, IndexSnapshot, StoreMeta, RECORD_SIZE};
pub use page::{FreeBitmap, PageClassStats, PageManager};
pub use store::{Store, WriteErrorHook};
pub use types::{Handle, PageAddr, PageRef};
