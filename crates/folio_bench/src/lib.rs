//! Benchmark utilities.

#![warn(missing_docs)]

use folio_core::{Blob, Store, StoreConfig};
use folio_storage::FlushMode;
use rand::Rng;
use std::sync::Arc;
use tempfile::TempDir;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Opens a store in a fresh temporary directory.
///
/// Benchmarks run with deferred sync so they measure the engine rather
/// than the disk.
pub fn temp_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::default().flush_mode(FlushMode::NoSync);
    let store = Store::open(&dir.path().join("store"), config).unwrap();
    (dir, store)
}

/// Creates `count` blobs with random payloads of `size` bytes.
pub fn populate(store: &Store, count: usize, size: usize) -> Vec<Arc<Blob>> {
    (0..count)
        .map(|i| {
            let meta = (i as u32).to_be_bytes();
            store.create(&meta, &random_data(size)).unwrap()
        })
        .collect()
}
