//! Test fixtures and store helpers.

use folio_core::{Store, StoreConfig};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test log subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A store in a temporary directory, removed on drop.
pub struct TestStore {
    store: Option<Store>,
    config: StoreConfig,
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TestStore {
    /// Opens a fresh store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Opens a fresh store with `config`.
    pub fn with_config(config: StoreConfig) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("store");
        let store = Store::open(&path, config.clone()).expect("Failed to open store");
        Self {
            store: Some(store),
            config,
            path,
            _temp_dir: temp_dir,
        }
    }

    /// The store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path inside the temporary directory but outside the store.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self._temp_dir.path().join(name)
    }

    /// Closes the store and opens it again from disk.
    pub fn reopen(&mut self) {
        if let Some(store) = self.store.take() {
            store.close().expect("Failed to close store");
        }
        let store = Store::open(&self.path, self.config.clone()).expect("Failed to reopen store");
        self.store = Some(store);
    }

    /// Closes the store but keeps its directory until drop.
    pub fn close(&mut self) {
        if let Some(store) = self.store.take() {
            store.close().expect("Failed to close store");
        }
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref().expect("store is closed")
    }
}

/// Runs a test with a temporary store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let store = TestStore::new();
    f(&store)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use folio_core::Blob;
    use std::sync::Arc;

    /// Creates a store holding `count` blobs whose payload sizes spread over
    /// several size classes.
    pub fn populated_store(count: usize) -> (TestStore, Vec<Arc<Blob>>) {
        let store = TestStore::new();
        let blobs = (0..count)
            .map(|i| {
                let meta = format!("m{i}").into_bytes();
                let data = vec![(i % 251) as u8; (i * 37) % 3000];
                store.create(&meta, &data).expect("Failed to create blob")
            })
            .collect();
        (store, blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_keeps_blobs() {
        let mut store = TestStore::new();
        let handle = store.create(b"m", b"data").unwrap().handle();
        store.reopen();

        let blob = store.blob(handle).unwrap();
        assert_eq!(store.read(&blob).unwrap(), b"data");
        assert_eq!(blob.meta(), b"m");
    }

    #[test]
    fn with_temp_store_runs_closure() {
        let len = with_temp_store(|store| {
            store.create(b"", b"x").unwrap();
            store.len()
        });
        assert_eq!(len, 1);
    }

    #[test]
    fn populated_scenario() {
        let (store, blobs) = scenarios::populated_store(20);
        assert_eq!(store.len(), 20);
        assert_eq!(store.read(&blobs[3]).unwrap().len(), 111);
    }
}
