//! Size-classed page storage.
//!
//! Payloads live in fixed-size pages. Every page file holds pages of exactly
//! one size class, a power of two between [`MIN_PAGE_SIZE`] and
//! [`MAX_PAGE_SIZE`], and up to [`PAGES_PER_FILE`] pages:
//!
//! ```text
//! <dir>/data000/data-000-000.p04   # file 0, 16-byte pages
//! <dir>/data000/data-000-001.p10   # file 1, 1 KiB pages
//! <dir>/data001/data-001-000.p04   # file 1000, 16-byte pages
//! ```
//!
//! File ids are global and sequential across all size classes.

mod bitmap;
mod file;
mod manager;

pub use bitmap::FreeBitmap;
pub use file::PageFile;
pub use manager::{PageClassStats, PageManager};

use crate::error::{CoreError, CoreResult};

/// Smallest page size class.
pub const MIN_PAGE_SIZE: u32 = 16;

/// Largest page size class, and the largest payload a blob may hold.
pub const MAX_PAGE_SIZE: u32 = 0x10_0000;

/// Number of pages in one page file.
pub const PAGES_PER_FILE: u32 = 0x1_0000;

/// Highest file id the naming scheme can express.
pub const MAX_PAGE_FILE_ID: u32 = 999_999;

/// Returns the smallest size class that holds `size` bytes.
///
/// # Errors
///
/// Returns `LimitExceeded` if `size` is larger than [`MAX_PAGE_SIZE`].
pub fn size_class(size: usize) -> CoreResult<u32> {
    if size > MAX_PAGE_SIZE as usize {
        return Err(CoreError::limit_exceeded(format!(
            "data size {size} exceeds maximum page size {MAX_PAGE_SIZE}"
        )));
    }
    Ok((size as u32).next_power_of_two().max(MIN_PAGE_SIZE))
}

/// Iterates every size class from smallest to largest.
pub fn size_classes() -> impl Iterator<Item = u32> {
    (MIN_PAGE_SIZE.trailing_zeros()..=MAX_PAGE_SIZE.trailing_zeros()).map(|shift| 1u32 << shift)
}

/// Returns the inclusive payload size range that maps to `page_size`.
#[must_use]
pub fn class_range(page_size: u32) -> (u32, u32) {
    if page_size == MIN_PAGE_SIZE {
        (0, page_size)
    } else {
        (page_size / 2 + 1, page_size)
    }
}

/// Returns the path of a page file relative to the store directory.
#[must_use]
pub fn page_file_name(file_id: u32, page_size: u32) -> String {
    let hi = file_id / 1000;
    let lo = file_id % 1000;
    format!(
        "data{hi:03}/data-{hi:03}-{lo:03}.p{:02}",
        page_size.trailing_zeros()
    )
}

/// Parses a page file name (`data-NNN-MMM.pSS`) into `(file_id, page_size)`.
///
/// Returns `None` for anything that isn't a page file name.
#[must_use]
pub fn parse_page_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("data-")?;
    let (hi, rest) = rest.split_once('-')?;
    let (lo, shift) = rest.split_once(".p")?;
    if hi.len() != 3 || lo.len() != 3 || shift.len() != 2 {
        return None;
    }

    let hi: u32 = hi.parse().ok()?;
    let lo: u32 = lo.parse().ok()?;
    let shift: u32 = shift.parse().ok()?;
    let page_size = 1u32.checked_shl(shift)?;
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return None;
    }
    Some((hi * 1000 + lo, page_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_boundaries() {
        assert_eq!(size_class(0).unwrap(), 16);
        assert_eq!(size_class(16).unwrap(), 16);
        assert_eq!(size_class(17).unwrap(), 32);
        assert_eq!(size_class(1000).unwrap(), 1024);
        assert_eq!(size_class(MAX_PAGE_SIZE as usize).unwrap(), MAX_PAGE_SIZE);
        assert!(matches!(
            size_class(MAX_PAGE_SIZE as usize + 1),
            Err(CoreError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn classes_cover_sixteen_to_one_mib() {
        let classes: Vec<u32> = size_classes().collect();
        assert_eq!(classes.len(), 17);
        assert_eq!(classes[0], 16);
        assert_eq!(*classes.last().unwrap(), MAX_PAGE_SIZE);
    }

    #[test]
    fn class_ranges_agree_with_size_class() {
        for page_size in size_classes() {
            let (min, max) = class_range(page_size);
            assert_eq!(size_class(min as usize).unwrap(), page_size);
            assert_eq!(size_class(max as usize).unwrap(), page_size);
        }
    }

    #[test]
    fn page_file_names() {
        assert_eq!(page_file_name(0, 16), "data000/data-000-000.p04");
        assert_eq!(page_file_name(1234, 1024), "data001/data-001-234.p10");
        assert_eq!(parse_page_file_name("data-001-234.p10"), Some((1234, 1024)));
        assert_eq!(parse_page_file_name("data-000-000.p04"), Some((0, 16)));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        for name in ["notes.txt", "data-1-2.p04", "data-000-000.p03", "data-000-000.p21", "data-abc-000.p04"] {
            assert_eq!(parse_page_file_name(name), None, "{name}");
        }
    }
}
