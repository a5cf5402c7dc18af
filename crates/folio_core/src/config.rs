//! Store and backup configuration.

use crate::error::{CoreError, CoreResult};
use folio_storage::FlushMode;
use std::time::Duration;

/// Smallest accepted history page size.
pub const MIN_HISTORY_PAGE_SIZE: Duration = Duration::from_secs(60 * 60);

/// Default archive path prefix for backups.
pub const DEFAULT_PATH_PREFIX: &str = "db-backup/";

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to reject all mutating calls.
    pub read_only: bool,

    /// Strict (fsync every write) or deferred durability.
    pub flush_mode: FlushMode,

    /// History page size written into the header of new stores.
    ///
    /// Existing stores keep the value recorded in their index header.
    pub history_page_size: Duration,

    /// Initial handle table capacity for a new store.
    pub initial_capacity: usize,

    /// Hard maximum number of handle table slots.
    pub max_blobs: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            flush_mode: FlushMode::Fsync,
            history_page_size: Duration::from_secs(24 * 60 * 60), // 1 day
            initial_capacity: 1024,
            max_blobs: 1_000_000_000,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether the store opens read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the flush mode.
    #[must_use]
    pub const fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Sets the history page size for new stores.
    #[must_use]
    pub const fn history_page_size(mut self, value: Duration) -> Self {
        self.history_page_size = value;
        self
    }

    /// Sets the initial handle table capacity.
    #[must_use]
    pub const fn initial_capacity(mut self, value: usize) -> Self {
        self.initial_capacity = value;
        self
    }

    /// Sets the maximum number of handle table slots.
    #[must_use]
    pub const fn max_blobs(mut self, value: usize) -> Self {
        self.max_blobs = value;
        self
    }

    /// Checks values that would otherwise produce an unusable store.
    pub fn validate(&self) -> CoreResult<()> {
        if self.history_page_size < MIN_HISTORY_PAGE_SIZE {
            return Err(CoreError::invalid_config(format!(
                "history page size {:?} is below the {:?} minimum",
                self.history_page_size, MIN_HISTORY_PAGE_SIZE
            )));
        }
        if self.max_blobs == 0 || self.max_blobs > u32::MAX as usize {
            return Err(CoreError::invalid_config(format!(
                "max blobs out of range: {}",
                self.max_blobs
            )));
        }
        Ok(())
    }
}

/// Options for a single backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Prefix prepended to every archive entry path; always ends with `/`.
    pub path_prefix: String,

    /// Artificial pause after the snapshot is taken (testing only).
    pub test_delay: Option<Duration>,

    /// Value reported by the completion signal on success.
    pub future_result: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            test_delay: None,
            future_result: None,
        }
    }
}

impl BackupOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the archive path prefix, appending a trailing `/` if missing.
    #[must_use]
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.path_prefix = prefix;
        self
    }

    /// Sets the artificial pause taken after the snapshot.
    #[must_use]
    pub fn test_delay(mut self, delay: Duration) -> Self {
        self.test_delay = Some(delay);
        self
    }

    /// Sets the value reported on successful completion.
    #[must_use]
    pub fn future_result(mut self, value: impl Into<String>) -> Self {
        self.future_result = Some(value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(!config.read_only);
        assert_eq!(config.flush_mode, FlushMode::Fsync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .read_only(true)
            .flush_mode(FlushMode::NoSync)
            .initial_capacity(8);

        assert!(config.read_only);
        assert_eq!(config.flush_mode, FlushMode::NoSync);
        assert_eq!(config.initial_capacity, 8);
    }

    #[test]
    fn short_history_page_rejected() {
        let config = StoreConfig::new().history_page_size(Duration::from_secs(60));
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn path_prefix_gets_trailing_slash() {
        let opts = BackupOptions::new().path_prefix("nightly");
        assert_eq!(opts.path_prefix, "nightly/");
        assert_eq!(BackupOptions::default().path_prefix, "db-backup/");
    }
}
