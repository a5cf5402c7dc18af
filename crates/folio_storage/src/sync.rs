//! Durability policy shared by every file of a store.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How writes are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// fsync after every page or index write.
    #[default]
    Fsync,
    /// Mark the file dirty; durability requires an explicit flush.
    NoSync,
}

impl FlushMode {
    /// Returns the canonical name (`"fsync"` or `"nosync"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fsync => "fsync",
            Self::NoSync => "nosync",
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fsync" => Ok(Self::Fsync),
            "nosync" => Ok(Self::NoSync),
            other => Err(format!("invalid flush mode: {other}")),
        }
    }
}

/// A runtime-switchable [`FlushMode`] shared by reference.
///
/// Every file opened by a store holds a clone, so switching the mode on the
/// store takes effect for all subsequent writes.
#[derive(Debug, Clone, Default)]
pub struct SyncPolicy {
    deferred: Arc<AtomicBool>,
}

impl SyncPolicy {
    /// Creates a policy starting in the given mode.
    #[must_use]
    pub fn new(mode: FlushMode) -> Self {
        Self {
            deferred: Arc::new(AtomicBool::new(mode == FlushMode::NoSync)),
        }
    }

    /// Returns the current mode.
    #[must_use]
    pub fn mode(&self) -> FlushMode {
        if self.is_deferred() {
            FlushMode::NoSync
        } else {
            FlushMode::Fsync
        }
    }

    /// Switches the mode for all holders of this policy.
    pub fn set_mode(&self, mode: FlushMode) {
        self.deferred
            .store(mode == FlushMode::NoSync, Ordering::SeqCst);
    }

    /// Returns true if writes should only mark the file dirty.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_mode_round_trips_names() {
        assert_eq!("fsync".parse::<FlushMode>().unwrap(), FlushMode::Fsync);
        assert_eq!("nosync".parse::<FlushMode>().unwrap(), FlushMode::NoSync);
        assert_eq!(FlushMode::NoSync.to_string(), "nosync");
        assert!("sometimes".parse::<FlushMode>().is_err());
    }

    #[test]
    fn policy_switch_is_shared() {
        let policy = SyncPolicy::new(FlushMode::Fsync);
        let clone = policy.clone();
        assert!(!clone.is_deferred());

        policy.set_mode(FlushMode::NoSync);
        assert!(clone.is_deferred());
        assert_eq!(clone.mode(), FlushMode::NoSync);
    }
}
