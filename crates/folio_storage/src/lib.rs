//! # Folio Storage
//!
//! Raw file layer for the Folio blob store.
//!
//! This crate provides the lowest-level I/O abstraction used by both the
//! durable index and the page files. Backends are **opaque positional byte
//! stores**: they read and write bytes at absolute offsets and know nothing
//! about pages, handles or index records.
//!
//! ## Design Principles
//!
//! - Positional I/O only (`read_at`, `write_at`), no append cursor
//! - Every backend carries its own lock, so a backend *is* the per-file lock
//! - Durability follows a shared [`SyncPolicy`]: strict mode syncs every
//!   write, deferred mode marks the file dirty until [`StorageBackend::flush`]
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`RawFile`] - Persistent storage using OS file APIs
//! - [`MemFile`] - In-memory storage for tests
//!
//! ## Example
//!
//! ```rust
//! use folio_storage::{MemFile, StorageBackend};
//!
//! let file = MemFile::new();
//! file.write_at(16, b"hello").unwrap();
//! let mut buf = [0u8; 5];
//! file.read_at(16, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod sync;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::RawFile;
pub use memory::MemFile;
pub use sync::{FlushMode, SyncPolicy};
