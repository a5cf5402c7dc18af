//! Error types for Folio core.

use crate::types::Handle;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Folio core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] folio_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Handle does not resolve to a blob (missing, deleted, or stale generation).
    #[error("unknown handle {handle}")]
    UnknownHandle {
        /// The handle that failed to resolve.
        handle: Handle,
    },

    /// Optimistic version check failed.
    #[error("concurrent write: current version {current} != expected {expected}")]
    ConcurrentWrite {
        /// The blob's version at the time of the check.
        current: u64,
        /// The version the caller expected.
        expected: u64,
    },

    /// A size or capacity limit was exceeded.
    #[error("limit exceeded: {message}")]
    LimitExceeded {
        /// Description of the limit.
        message: String,
    },

    /// Operation not permitted in the current state.
    ///
    /// Covers closed and read-only stores as well as broken allocator or
    /// index contracts (duplicate free, double set, unbalanced unfreeze).
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Index header or record failed validation on open.
    #[error("invalid store format: {message}")]
    Format {
        /// Description of the format issue.
        message: String,
    },

    /// Store directory is locked by another process.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// Configuration value rejected.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of the rejected value.
        message: String,
    },

    /// Handle string could not be parsed.
    #[error("invalid blob handle string: {input}")]
    InvalidHandle {
        /// The rejected input.
        input: String,
    },
}

impl CoreError {
    /// Creates an unknown handle error.
    pub fn unknown_handle(handle: Handle) -> Self {
        Self::UnknownHandle { handle }
    }

    /// Creates a limit exceeded error.
    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::LimitExceeded {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Creates an invalid config error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Error for any call against a closed store.
    pub fn store_closed() -> Self {
        Self::invalid_state("store is closed")
    }

    /// Error for a mutating call against a read-only store.
    pub fn store_read_only() -> Self {
        Self::invalid_state("store is readonly")
    }

    /// Returns true for disk-level failures (the IOFailure class).
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}
