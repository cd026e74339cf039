//! # Update Allocator
//!
//! Scoped reservation of the block nodes tree updates may need. A range
//! update splits at most the first and the last block it touches, so two
//! nodes per update always suffice. Reserving them before the backend is
//! touched means the tree half of an operation can never fail.

use super::block::MemoryBlock;
use super::block_manager::MemoryBlockManager;
use crate::allocator::SlotId;
use crate::{MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use arrayvec::ArrayVec;
use tessera_hal::VirtAddr;

/// Maximum nodes one range update can insert
pub const MAX_BLOCKS_PER_UPDATE: usize = 2;

/// Maximum updates one reservation can cover
pub const MAX_UPDATES_PER_RESERVATION: usize = 2;

/// Reserved node slots
pub(super) type ReservedSlots =
    ArrayVec<SlotId, { MAX_BLOCKS_PER_UPDATE * MAX_UPDATES_PER_RESERVATION }>;

/// Guard holding pre-reserved block nodes
///
/// Unused nodes go back to the manager's slab when the guard is dropped.
#[derive(Debug)]
pub struct UpdateAllocator<'a> {
    manager: &'a mut MemoryBlockManager,
    reserved: ReservedSlots,
}

impl<'a> UpdateAllocator<'a> {
    pub(super) fn new(manager: &'a mut MemoryBlockManager, updates: usize) -> MemResult<Self> {
        assert!(
            (1..=MAX_UPDATES_PER_RESERVATION).contains(&updates),
            "cannot reserve for {updates} updates"
        );

        let mut reserved = ReservedSlots::new();
        while reserved.len() < updates * MAX_BLOCKS_PER_UPDATE {
            match manager.slab_mut().acquire() {
                Ok(slot) => reserved.push(slot),
                Err(err) => {
                    for slot in reserved {
                        manager.slab_mut().release(slot);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { manager, reserved })
    }

    /// Nodes still available to this update
    pub fn remaining(&self) -> usize {
        self.reserved.len()
    }

    /// Read access to the manager while the reservation is held
    pub fn manager(&self) -> &MemoryBlockManager {
        self.manager
    }

    /// Reclassify every block in the range
    pub fn update(
        &mut self,
        addr: VirtAddr,
        num_pages: u64,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) {
        self.manager.apply_range(
            &mut self.reserved,
            addr,
            num_pages,
            |block| !block.is_update_noop(state, permission, attribute),
            |block| block.update(state, permission, attribute),
        );
    }

    /// Reclassify only the blocks in the range that currently match the
    /// expected previous triple
    pub fn update_if_match(
        &mut self,
        addr: VirtAddr,
        num_pages: u64,
        prev_state: MemoryState,
        prev_permission: MemoryPermission,
        prev_attribute: MemoryAttribute,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) {
        let prev_attribute = prev_attribute | MemoryAttribute::IPC_AND_DEVICE_MAPPED;
        self.manager.apply_range(
            &mut self.reserved,
            addr,
            num_pages,
            |block| {
                block.has_properties(prev_state, prev_permission, prev_attribute)
                    && !block.is_update_noop(state, permission, attribute)
            },
            |block| block.update(state, permission, attribute),
        );
    }

    /// Run a lock mutator on every block in the range
    pub fn update_lock<F>(&mut self, addr: VirtAddr, num_pages: u64, mut lock: F, permission: MemoryPermission)
    where
        F: FnMut(&mut MemoryBlock, MemoryPermission),
    {
        self.manager.apply_range(
            &mut self.reserved,
            addr,
            num_pages,
            |_| true,
            |block| lock(block, permission),
        );
    }
}

impl Drop for UpdateAllocator<'_> {
    fn drop(&mut self) {
        for slot in self.reserved.drain(..) {
            self.manager.slab_mut().release(slot);
        }
    }
}
