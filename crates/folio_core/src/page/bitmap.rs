//! Fixed-capacity free-slot bitmap.

use crate::error::{CoreError, CoreResult};

/// A bit-per-slot allocator with a cursor-based first-fit scan.
///
/// The cursor is the lowest byte that may still contain a free bit. `alloc`
/// scans bytes from the cursor to the end and then wraps once to the start;
/// `free` pulls the cursor back to the freed byte. Together these keep the
/// lowest available slot the next one handed out, which keeps page files
/// compact under churn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBitmap {
    bits: Vec<u8>,
    cursor: usize,
    num_used: u32,
}

impl FreeBitmap {
    /// Creates an empty bitmap with `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `capacity` is not a multiple of 8.
    pub fn new(capacity: u32) -> CoreResult<Self> {
        if capacity % 8 != 0 {
            return Err(CoreError::invalid_state(format!(
                "bitmap capacity must be a multiple of 8: {capacity}"
            )));
        }
        Ok(Self {
            bits: vec![0; (capacity / 8) as usize],
            cursor: 0,
            num_used: 0,
        })
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        (self.bits.len() * 8) as u32
    }

    /// Returns the number of used slots.
    #[must_use]
    pub fn num_used(&self) -> u32 {
        self.num_used
    }

    /// Returns true if no slot is free.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.num_used == self.capacity()
    }

    /// Returns true if `slot` is in range and marked used.
    #[must_use]
    pub fn is_used(&self, slot: u32) -> bool {
        let (byte, mask) = Self::locate(slot);
        self.bits.get(byte).is_some_and(|b| b & mask != 0)
    }

    /// Marks the lowest free slot at or after the cursor as used.
    ///
    /// Returns `None` when the bitmap is full.
    pub fn alloc(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }

        let len = self.bits.len();
        let start = self.cursor.min(len);
        let byte = (start..len)
            .chain(0..start)
            .find(|&i| self.bits[i] != 0xff)?;

        let bit = (!self.bits[byte]).trailing_zeros();
        self.bits[byte] |= 1 << bit;
        self.cursor = byte;
        self.num_used += 1;
        Some(byte as u32 * 8 + bit)
    }

    /// Returns `slot` to the free pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the slot is out of range or already free.
    pub fn free(&mut self, slot: u32) -> CoreResult<()> {
        let (byte, mask) = self.checked_locate(slot)?;
        if self.bits[byte] & mask == 0 {
            return Err(CoreError::invalid_state(format!(
                "slot {slot} is already free"
            )));
        }
        self.bits[byte] &= !mask;
        self.cursor = self.cursor.min(byte);
        self.num_used -= 1;
        Ok(())
    }

    /// Marks a specific slot used. Only index replay calls this.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the slot is out of range or already used.
    pub fn mark_used(&mut self, slot: u32) -> CoreResult<()> {
        let (byte, mask) = self.checked_locate(slot)?;
        if self.bits[byte] & mask != 0 {
            return Err(CoreError::invalid_state(format!(
                "slot {slot} is already used"
            )));
        }
        self.bits[byte] |= mask;
        self.num_used += 1;
        Ok(())
    }

    fn locate(slot: u32) -> (usize, u8) {
        ((slot / 8) as usize, 1u8 << (slot % 8))
    }

    fn checked_locate(&self, slot: u32) -> CoreResult<(usize, u8)> {
        if slot >= self.capacity() {
            return Err(CoreError::invalid_state(format!(
                "slot {slot} out of range (capacity {})",
                self.capacity()
            )));
        }
        Ok(Self::locate(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn count_bits(bitmap: &FreeBitmap) -> u32 {
        (0..bitmap.capacity()).filter(|&s| bitmap.is_used(s)).count() as u32
    }

    #[test]
    fn rejects_unaligned_capacity() {
        assert!(FreeBitmap::new(12).is_err());
        assert!(FreeBitmap::new(16).is_ok());
    }

    #[test]
    fn alloc_is_sequential_then_full() {
        let mut bitmap = FreeBitmap::new(16).unwrap();
        for expected in 0..16 {
            assert_eq!(bitmap.alloc(), Some(expected));
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.alloc(), None);
    }

    #[test]
    fn free_reuses_lowest_slot() {
        let mut bitmap = FreeBitmap::new(32).unwrap();
        for _ in 0..20 {
            bitmap.alloc();
        }
        bitmap.free(17).unwrap();
        bitmap.free(3).unwrap();

        assert_eq!(bitmap.alloc(), Some(3));
        assert_eq!(bitmap.alloc(), Some(17));
        assert_eq!(bitmap.alloc(), Some(20));
    }

    #[test]
    fn double_free_fails() {
        let mut bitmap = FreeBitmap::new(8).unwrap();
        let slot = bitmap.alloc().unwrap();
        bitmap.free(slot).unwrap();
        assert!(matches!(
            bitmap.free(slot),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn mark_used_twice_fails() {
        let mut bitmap = FreeBitmap::new(8).unwrap();
        bitmap.mark_used(5).unwrap();
        assert!(bitmap.mark_used(5).is_err());
        assert!(bitmap.mark_used(8).is_err());
        assert_eq!(bitmap.num_used(), 1);

        // replayed slots are skipped by alloc
        assert_eq!(bitmap.alloc(), Some(0));
        for _ in 0..4 {
            bitmap.alloc();
        }
        assert_eq!(bitmap.alloc(), Some(6));
    }

    #[test]
    fn free_pulls_cursor_back() {
        let mut bitmap = FreeBitmap::new(24).unwrap();
        for _ in 0..24 {
            bitmap.alloc();
        }
        bitmap.free(2).unwrap();
        // cursor sits at byte 0 now; a later free further up doesn't move it
        bitmap.free(22).unwrap();
        assert_eq!(bitmap.alloc(), Some(2));
        assert_eq!(bitmap.alloc(), Some(22));
    }

    proptest! {
        #[test]
        fn num_used_matches_bits(ops in prop::collection::vec(any::<(bool, u8)>(), 0..200)) {
            let mut bitmap = FreeBitmap::new(64).unwrap();
            let mut live: Vec<u32> = Vec::new();

            for (is_alloc, pick) in ops {
                if is_alloc || live.is_empty() {
                    if let Some(slot) = bitmap.alloc() {
                        prop_assert!(!live.contains(&slot));
                        live.push(slot);
                    } else {
                        prop_assert_eq!(live.len(), 64);
                    }
                } else {
                    let slot = live.swap_remove(pick as usize % live.len());
                    bitmap.free(slot).unwrap();
                }
                prop_assert_eq!(bitmap.num_used(), count_bits(&bitmap));
                prop_assert_eq!(bitmap.num_used() as usize, live.len());
            }
        }

        #[test]
        fn refill_after_any_free_order_is_full(order in Just((0u32..40).collect::<Vec<_>>()).prop_shuffle()) {
            let mut bitmap = FreeBitmap::new(40).unwrap();
            for _ in 0..40 {
                bitmap.alloc();
            }
            let full = bitmap.clone();

            for slot in &order[..order.len() / 2] {
                bitmap.free(*slot).unwrap();
            }
            while bitmap.alloc().is_some() {}

            prop_assert_eq!(&bitmap.bits, &full.bits);
            prop_assert_eq!(bitmap.num_used(), 40);
        }
    }
}
