//! # Folio Testkit
//!
//! Test utilities for Folio.
//!
//! This crate provides:
//! - Temporary on-disk stores that can be closed and reopened
//! - Opt-in log output for tests via `RUST_LOG`
//! - Property-based test generators using proptest
//! - Concurrent load helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use folio_testkit::prelude::*;
//!
//! #[test]
//! fn survives_reopen() {
//!     let mut store = TestStore::new();
//!     let handle = store.create(b"m", b"data").unwrap().handle();
//!     store.reopen();
//!     assert!(store.blob(handle).is_ok());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
