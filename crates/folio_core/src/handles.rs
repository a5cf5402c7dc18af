//! Direct-indexed handle table.

use crate::blob::Blob;
use crate::error::{CoreError, CoreResult};
use crate::types::Handle;
use rand::Rng;
use std::sync::Arc;

/// Smallest table capacity.
const MIN_CAPACITY: usize = 32;

/// Maps the slot bits of a handle to the blob in that slot.
///
/// Slots are addressed directly by `handle.slot()`; this is not a hash map.
/// A slot is empty, active, or holds a tombstone (a deleted blob). Lookups
/// compare the full 64-bit handle, so a stale handle whose slot has been
/// reused by a newer blob no longer resolves.
///
/// The table only grows. It is not internally synchronized; the durable
/// index owns it behind its lock.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Option<Arc<Blob>>>,
    cursor: usize,
    len: usize,
    deleted_len: usize,
    max: usize,
}

impl HandleTable {
    /// Creates a table sized for about `hint` blobs, never growing past `max`.
    #[must_use]
    pub fn new(hint: usize, max: usize) -> Self {
        let capacity = hint.max(MIN_CAPACITY).next_power_of_two().min(max);
        Self {
            slots: vec![None; capacity],
            cursor: 0,
            len: 0,
            deleted_len: 0,
            max,
        }
    }

    /// Number of active blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no blob is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of tombstones.
    #[must_use]
    pub fn deleted_len(&self) -> usize {
        self.deleted_len
    }

    /// Current number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Picks a fresh handle for the next [`set`](Self::set).
    ///
    /// The generation is random, never zero and never all ones. The slot is
    /// the first empty or tombstoned slot from the cursor on, wrapping once;
    /// when there is none the table doubles.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` if the table is full and already at its maximum.
    pub fn alloc_handle(&mut self) -> CoreResult<Handle> {
        let mut rng = rand::thread_rng();
        let generation = loop {
            let g: u32 = rng.gen();
            if g != 0 && g != u32::MAX {
                break g;
            }
        };

        let n = self.slots.len();
        let start = self.cursor.min(n);
        let free = (start..n)
            .chain(0..start)
            .find(|&i| self.slots[i].as_ref().map_or(true, |b| b.is_deleted()));

        let slot = match free {
            Some(slot) => slot,
            None => {
                let old = n;
                self.grow(old + 1)?;
                old
            }
        };
        Ok(Handle::new(generation, slot as u32))
    }

    /// Installs a blob in its slot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the slot holds an active blob, or
    /// `LimitExceeded` if the slot is beyond the maximum capacity.
    pub fn set(&mut self, blob: Arc<Blob>) -> CoreResult<()> {
        let slot = blob.handle().slot() as usize;
        if slot >= self.slots.len() {
            self.grow(slot + 1)?;
        }

        if let Some(existing) = &self.slots[slot] {
            if !existing.is_deleted() {
                return Err(CoreError::invalid_state(format!(
                    "slot {slot} already holds active blob {}",
                    existing.handle()
                )));
            }
            self.deleted_len -= 1;
        }

        if blob.is_deleted() {
            self.deleted_len += 1;
        } else {
            self.len += 1;
        }
        self.slots[slot] = Some(blob);
        self.cursor = slot;
        Ok(())
    }

    /// Turns an active occupant into a tombstone after it was deleted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `blob` is not the current occupant of its
    /// slot or is not yet marked deleted.
    pub fn free(&mut self, blob: &Arc<Blob>) -> CoreResult<()> {
        let slot = blob.handle().slot() as usize;
        let occupant = self.slots.get(slot).and_then(Option::as_ref);
        if !occupant.is_some_and(|o| Arc::ptr_eq(o, blob)) {
            return Err(CoreError::invalid_state(format!(
                "blob {} is not the occupant of slot {slot}",
                blob.handle()
            )));
        }
        if !blob.is_deleted() {
            return Err(CoreError::invalid_state(format!(
                "blob {} freed before delete",
                blob.handle()
            )));
        }

        self.len -= 1;
        self.deleted_len += 1;
        self.cursor = self.cursor.min(slot);
        Ok(())
    }

    /// Returns the active blob with exactly this handle.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<Arc<Blob>> {
        self.slots
            .get(handle.slot() as usize)
            .and_then(Option::as_ref)
            .filter(|b| b.handle() == handle && !b.is_deleted())
            .cloned()
    }

    /// Like [`get`](Self::get) but fails with `UnknownHandle`.
    pub fn get_checked(&self, handle: Handle) -> CoreResult<Arc<Blob>> {
        self.get(handle)
            .ok_or_else(|| CoreError::unknown_handle(handle))
    }

    /// Returns the tombstone in the handle's slot.
    ///
    /// Only the slot is compared: tombstones replayed from disk carry no
    /// generation.
    #[must_use]
    pub fn deleted_get(&self, handle: Handle) -> Option<Arc<Blob>> {
        self.slots
            .get(handle.slot() as usize)
            .and_then(Option::as_ref)
            .filter(|b| b.is_deleted())
            .cloned()
    }

    /// Returns true if `blob` is the active occupant of its slot.
    #[must_use]
    pub fn holds(&self, blob: &Arc<Blob>) -> bool {
        self.slots
            .get(blob.handle().slot() as usize)
            .and_then(Option::as_ref)
            .is_some_and(|o| Arc::ptr_eq(o, blob) && !o.is_deleted())
    }

    /// Moves the cursor back to slot 0. Called once replay is done.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Iterates all occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Blob>> {
        self.slots.iter().flatten()
    }

    /// Returns the raw slot array.
    #[must_use]
    pub fn slots(&self) -> &[Option<Arc<Blob>>] {
        &self.slots
    }

    fn grow(&mut self, needed: usize) -> CoreResult<()> {
        let current = self.slots.len();
        if needed > self.max || current >= self.max {
            return Err(CoreError::limit_exceeded(format!(
                "handle table full ({} slots max)",
                self.max
            )));
        }
        let mut capacity = current.max(1);
        while capacity < needed {
            capacity *= 2;
        }
        self.slots.resize(capacity.min(self.max), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobState;
    use crate::types::{PageAddr, PageRef};
    use proptest::prelude::*;

    fn active(handle: Handle) -> Arc<Blob> {
        Arc::new(Blob::new(
            handle,
            BlobState {
                meta: Vec::new(),
                version: 1,
                page: Some(PageRef::new(PageAddr::new(0, handle.slot()), 0)),
            },
        ))
    }

    fn tombstone(blob: &Blob) {
        let mut state = blob.state();
        state.page = None;
        blob.set_state(state);
    }

    fn insert(table: &mut HandleTable) -> Arc<Blob> {
        let handle = table.alloc_handle().unwrap();
        let blob = active(handle);
        table.set(blob.clone()).unwrap();
        blob
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(HandleTable::new(0, 1000).capacity(), 32);
        assert_eq!(HandleTable::new(100, 1000).capacity(), 128);
        assert_eq!(HandleTable::new(5000, 1000).capacity(), 1000);
    }

    #[test]
    fn generations_are_never_reserved_values() {
        let mut table = HandleTable::new(32, 64);
        for _ in 0..200 {
            let h = table.alloc_handle().unwrap();
            assert_ne!(h.generation(), 0);
            assert_ne!(h.generation(), u32::MAX);
        }
    }

    #[test]
    fn set_then_get() {
        let mut table = HandleTable::new(32, 64);
        let blob = insert(&mut table);
        let found = table.get(blob.handle()).unwrap();
        assert!(Arc::ptr_eq(&found, &blob));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn set_over_active_slot_fails() {
        let mut table = HandleTable::new(32, 64);
        let blob = insert(&mut table);
        let clash = active(Handle::new(99, blob.handle().slot()));
        assert!(matches!(
            table.set(clash),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn delete_then_reuse_keeps_stale_handle_dead() {
        let mut table = HandleTable::new(32, 64);
        let old = insert(&mut table);
        tombstone(&old);
        table.free(&old).unwrap();

        assert!(table.get(old.handle()).is_none());
        assert!(table.deleted_get(old.handle()).is_some());
        assert!(matches!(
            table.get_checked(old.handle()),
            Err(CoreError::UnknownHandle { .. })
        ));

        let new = insert(&mut table);
        assert_eq!(new.handle().slot(), old.handle().slot());
        assert_ne!(new.handle(), old.handle());
        assert!(table.get(old.handle()).is_none());
        assert!(table.get(new.handle()).is_some());
        assert_eq!(table.deleted_len(), 0);
    }

    #[test]
    fn free_requires_deleted_occupant() {
        let mut table = HandleTable::new(32, 64);
        let blob = insert(&mut table);
        assert!(table.free(&blob).is_err());

        let impostor = active(blob.handle());
        tombstone(&impostor);
        assert!(table.free(&impostor).is_err());
    }

    #[test]
    fn grows_by_doubling_until_max() {
        let mut table = HandleTable::new(32, 64);
        for _ in 0..32 {
            insert(&mut table);
        }
        assert_eq!(table.capacity(), 32);

        let blob = insert(&mut table);
        assert_eq!(blob.handle().slot(), 32);
        assert_eq!(table.capacity(), 64);

        for _ in 0..31 {
            insert(&mut table);
        }
        assert!(matches!(
            table.alloc_handle(),
            Err(CoreError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn set_grows_for_replayed_slots() {
        let mut table = HandleTable::new(32, 1024);
        table.set(active(Handle::new(5, 300))).unwrap();
        assert_eq!(table.capacity(), 512);
        assert!(table.get(Handle::new(5, 300)).is_some());
        assert!(table.set(active(Handle::new(5, 2000))).is_err());
    }

    proptest! {
        #[test]
        fn live_handles_always_resolve(ops in prop::collection::vec(any::<(bool, u16)>(), 1..150)) {
            let mut table = HandleTable::new(32, 4096);
            let mut live: Vec<Arc<Blob>> = Vec::new();
            let mut dead: Vec<Handle> = Vec::new();

            for (create, pick) in ops {
                if create || live.is_empty() {
                    live.push(insert(&mut table));
                } else {
                    let blob = live.swap_remove(pick as usize % live.len());
                    tombstone(&blob);
                    table.free(&blob).unwrap();
                    dead.push(blob.handle());
                }

                for blob in &live {
                    let found = table.get(blob.handle());
                    prop_assert!(found.is_some_and(|f| Arc::ptr_eq(&f, blob)));
                }
                for handle in &dead {
                    prop_assert!(table.get(*handle).is_none());
                }
                prop_assert_eq!(table.len(), live.len());
            }
        }
    }
}
