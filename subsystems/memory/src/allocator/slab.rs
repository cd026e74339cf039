//! # Slab Arena
//!
//! A slab of fixed-type slots addressed by index. Vacant slots form an
//! intrusive free list through their `next` links, so freeing and reusing
//! a slot never moves any other value.

use crate::{MemError, MemResult};
use alloc::vec::Vec;

/// Index of a slot inside a [`Slab`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Raw slot index
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A single slot
#[derive(Debug)]
enum Entry<T> {
    /// Holds a live value
    Occupied(T),
    /// Handed out but not yet filled
    Reserved,
    /// On the free list
    Vacant { next: Option<usize> },
}

/// Slab usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    /// Slots ever filled
    pub allocations: u64,
    /// Slots ever freed
    pub deallocations: u64,
    /// Live values
    pub live: usize,
    /// Total slots, live or not
    pub capacity: usize,
}

/// Slab arena
#[derive(Debug)]
pub struct Slab<T> {
    /// Slot storage
    entries: Vec<Entry<T>>,
    /// Free list head (index)
    free_head: Option<usize>,
    /// Number of occupied slots
    live: usize,
    /// Statistics
    allocations: u64,
    deallocations: u64,
}

impl<T> Slab<T> {
    /// Create an empty slab
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            live: 0,
            allocations: 0,
            deallocations: 0,
        }
    }

    /// Take a slot off the free list, growing the slab if it is empty
    ///
    /// The slot stays reserved until it is either filled or released.
    pub fn acquire(&mut self) -> MemResult<SlotId> {
        if let Some(index) = self.free_head {
            let Entry::Vacant { next } = self.entries[index] else {
                panic!("slab free list points at a non-vacant slot {index}");
            };
            self.free_head = next;
            self.entries[index] = Entry::Reserved;
            return Ok(SlotId(index));
        }

        self.entries
            .try_reserve(1)
            .map_err(|_| MemError::OutOfMemory)?;
        self.entries.push(Entry::Reserved);
        Ok(SlotId(self.entries.len() - 1))
    }

    /// Store a value in a reserved slot
    pub fn fill(&mut self, slot: SlotId, value: T) {
        let entry = &mut self.entries[slot.0];
        assert!(matches!(entry, Entry::Reserved), "filling unreserved slot {}", slot.0);
        *entry = Entry::Occupied(value);
        self.live += 1;
        self.allocations += 1;
    }

    /// Return a reserved, unfilled slot to the free list
    pub fn release(&mut self, slot: SlotId) {
        assert!(
            matches!(self.entries[slot.0], Entry::Reserved),
            "releasing unreserved slot {}",
            slot.0
        );
        self.push_free(slot.0);
    }

    /// Acquire and fill a slot in one step
    pub fn insert(&mut self, value: T) -> MemResult<SlotId> {
        let slot = self.acquire()?;
        self.fill(slot, value);
        Ok(slot)
    }

    /// Remove the value in an occupied slot and free the slot
    pub fn remove(&mut self, slot: SlotId) -> T {
        let entry = core::mem::replace(&mut self.entries[slot.0], Entry::Reserved);
        let Entry::Occupied(value) = entry else {
            panic!("removing empty slot {}", slot.0);
        };
        self.push_free(slot.0);
        self.live -= 1;
        self.deallocations += 1;
        value
    }

    /// Get the value in a slot
    pub fn get(&self, slot: SlotId) -> Option<&T> {
        match self.entries.get(slot.0) {
            Some(Entry::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    /// Get the value in a slot mutably
    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut T> {
        match self.entries.get_mut(slot.0) {
            Some(Entry::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the slab holds no live value
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Get statistics
    pub fn stats(&self) -> SlabStats {
        SlabStats {
            allocations: self.allocations,
            deallocations: self.deallocations,
            live: self.live,
            capacity: self.entries.len(),
        }
    }

    fn push_free(&mut self, index: usize) {
        self.entries[index] = Entry::Vacant {
            next: self.free_head,
        };
        self.free_head = Some(index);
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::ops::Index<SlotId> for Slab<T> {
    type Output = T;

    fn index(&self, slot: SlotId) -> &T {
        match self.get(slot) {
            Some(value) => value,
            None => panic!("slot {} is not occupied", slot.0),
        }
    }
}

impl<T> core::ops::IndexMut<SlotId> for Slab<T> {
    fn index_mut(&mut self, slot: SlotId) -> &mut T {
        match self.get_mut(slot) {
            Some(value) => value,
            None => panic!("slot {} is not occupied", slot.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_reuse() {
        let mut slab = Slab::new();
        let a = slab.insert(10u32).unwrap();
        let b = slab.insert(20u32).unwrap();
        assert_eq!(slab[a], 10);
        assert_eq!(slab[b], 20);
        assert_eq!(slab.len(), 2);

        assert_eq!(slab.remove(a), 10);
        assert_eq!(slab.get(a), None);

        // Freed slot is reused before the slab grows
        let c = slab.insert(30).unwrap();
        assert_eq!(c, a);
        assert_eq!(slab.stats().capacity, 2);
    }

    #[test]
    fn test_reserved_slots_are_not_visible() {
        let mut slab: Slab<u32> = Slab::new();
        let slot = slab.acquire().unwrap();
        assert_eq!(slab.get(slot), None);
        assert!(slab.is_empty());

        slab.release(slot);
        let again = slab.acquire().unwrap();
        assert_eq!(again, slot);
        slab.fill(again, 7);
        assert_eq!(slab[again], 7);
    }

    #[test]
    fn test_stats() {
        let mut slab = Slab::new();
        let a = slab.insert(1u8).unwrap();
        slab.insert(2u8).unwrap();
        slab.remove(a);

        let stats = slab.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.live, 1);
    }

    #[test]
    #[should_panic]
    fn test_double_remove_panics() {
        let mut slab = Slab::new();
        let a = slab.insert(1u8).unwrap();
        slab.remove(a);
        slab.remove(a);
    }
}
