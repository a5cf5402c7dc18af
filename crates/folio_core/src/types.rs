//! Core type definitions for Folio.

use crate::error::CoreError;
use std::fmt;
use std::str::FromStr;

/// Stable 64-bit blob identifier.
///
/// The high 32 bits hold a random generation, the low 32 bits the slot
/// index in the handle table. A generation is never zero and never all
/// ones for a live handle, so a stale handle whose slot was reused by a
/// different blob never resolves to the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// Joins a generation and slot index.
    #[must_use]
    pub const fn new(generation: u32, slot: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    /// Returns the random generation (high 32 bits).
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the slot index (low 32 bits).
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.generation(), self.slot())
    }
}

impl FromStr for Handle {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidHandle {
            input: s.to_string(),
        };
        let (hi, lo) = s.split_once('.').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Self::new(hi, lo))
    }
}

/// Physical location of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageAddr {
    /// Global page file id.
    pub file_id: u32,
    /// Page index within the file.
    pub page_id: u32,
}

impl PageAddr {
    /// Creates a new page address.
    #[must_use]
    pub const fn new(file_id: u32, page_id: u32) -> Self {
        Self { file_id, page_id }
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_id)
    }
}

/// A blob's payload location: the page it lives in and how many bytes of
/// that page are data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    /// Page holding the payload.
    pub addr: PageAddr,
    /// Payload length in bytes.
    pub size: u32,
}

impl PageRef {
    /// Creates a new page reference.
    #[must_use]
    pub const fn new(addr: PageAddr, size: u32) -> Self {
        Self { addr, size }
    }
}
