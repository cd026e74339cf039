//! # Memory Block Manager
//!
//! Ordered, gap-free tiling of an address range with [`MemoryBlock`]s.
//! Blocks live in a slab arena and are indexed by start address; range
//! updates split at the edges of the range and coalesce neighbours that end
//! up with identical properties.

use super::block::{MemoryBlock, MemoryInfo};
use super::update_allocator::{ReservedSlots, UpdateAllocator, MAX_BLOCKS_PER_UPDATE};
use crate::allocator::{Slab, SlabStats, SlotId};
use crate::{bytes_of, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use alloc::collections::BTreeMap;
use tessera_hal::{VirtAddr, PAGE_SIZE};

/// Block tree for one address space
#[derive(Debug)]
pub struct MemoryBlockManager {
    start: VirtAddr,
    end: VirtAddr,
    tree: BTreeMap<VirtAddr, SlotId>,
    slab: Slab<MemoryBlock>,
}

impl MemoryBlockManager {
    /// Create a manager covering `[start, end)` with a single free block
    pub fn new(start: VirtAddr, end: VirtAddr) -> MemResult<Self> {
        assert!(start.is_page_aligned() && end.is_page_aligned(), "unaligned block range");
        assert!(start < end, "empty block range");

        let mut slab = Slab::new();
        let slot = slab.insert(MemoryBlock::new(
            start,
            (end - start) / PAGE_SIZE,
            MemoryState::FREE,
            MemoryPermission::NONE,
            MemoryAttribute::NONE,
        ))?;

        let mut tree = BTreeMap::new();
        tree.insert(start, slot);

        log::trace!("block manager covering {}..{}", start, end);
        Ok(Self {
            start,
            end,
            tree,
            slab,
        })
    }

    /// First managed address
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// End of the managed range (exclusive)
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Number of blocks in the tree
    pub fn block_count(&self) -> usize {
        self.tree.len()
    }

    /// Arena statistics
    pub fn slab_stats(&self) -> SlabStats {
        self.slab.stats()
    }

    /// Block containing `addr`
    pub fn find_block(&self, addr: VirtAddr) -> Option<&MemoryBlock> {
        self.find_slot(addr).map(|slot| &self.slab[slot])
    }

    /// Snapshot of the block containing `addr`
    pub fn memory_info(&self, addr: VirtAddr) -> Option<MemoryInfo> {
        self.find_block(addr).map(MemoryBlock::memory_info)
    }

    /// All blocks in address order
    pub fn iter(&self) -> impl Iterator<Item = &MemoryBlock> + '_ {
        self.tree.values().map(move |&slot| &self.slab[slot])
    }

    /// Blocks overlapping `[start, end)` in address order, starting with the
    /// one containing `start`
    pub fn iter_range(&self, start: VirtAddr, end: VirtAddr) -> impl Iterator<Item = &MemoryBlock> + '_ {
        let first = self.find_key(start).unwrap_or(end).min(end);
        self.tree
            .range(first..end)
            .map(move |(_, &slot)| &self.slab[slot])
    }

    /// Visit every block overlapping `[start, end)`
    pub fn iterate_for_range<F>(&self, start: VirtAddr, end: VirtAddr, mut f: F)
    where
        F: FnMut(&MemoryInfo),
    {
        for block in self.iter_range(start, end) {
            f(&block.memory_info());
        }
    }

    /// Lowest address in the region where `num_pages` fit with `guard_pages`
    /// free on each side, placed at `offset` past an `alignment` boundary
    ///
    /// Only free blocks are considered and the whole placement, guards
    /// included, must sit inside both one free block and the region.
    pub fn find_free_area(
        &self,
        region_start: VirtAddr,
        region_num_pages: u64,
        num_pages: u64,
        alignment: u64,
        offset: u64,
        guard_pages: u64,
    ) -> Option<VirtAddr> {
        if num_pages == 0 || region_num_pages == 0 {
            return None;
        }
        debug_assert!(alignment.is_power_of_two() && alignment >= PAGE_SIZE);

        let region_last = region_start.checked_add(region_num_pages.checked_mul(PAGE_SIZE)?)? - 1;
        let guard_size = guard_pages.checked_mul(PAGE_SIZE)?;
        let span = num_pages.checked_add(guard_pages)?.checked_mul(PAGE_SIZE)?;
        let first = self.find_key(region_start)?;

        for (_, &slot) in self.tree.range(first..) {
            let block = &self.slab[slot];
            if block.address() > region_last {
                break;
            }
            if block.state() != MemoryState::FREE {
                continue;
            }

            let Some(mut area) = block.address().max(region_start).checked_add(guard_size) else {
                continue;
            };
            let offset_area = area.align_down(alignment) + offset;
            area = if area <= offset_area {
                offset_area
            } else {
                offset_area + alignment
            };

            let Some(area_end) = area.checked_add(span) else {
                continue;
            };
            let area_last = area_end - 1;

            if block.address() <= area
                && area < area_last
                && area_last <= region_last
                && area_last <= block.last_address()
            {
                return Some(area);
            }
        }

        None
    }

    /// Reserve the nodes for one range update
    pub fn update_allocator(&mut self) -> MemResult<UpdateAllocator<'_>> {
        UpdateAllocator::new(self, 1)
    }

    /// Reserve the nodes for `updates` range updates made under one lock
    pub fn update_allocator_for(&mut self, updates: usize) -> MemResult<UpdateAllocator<'_>> {
        UpdateAllocator::new(self, updates)
    }

    /// Verify the tiling invariants, logging the first violation found
    pub fn check_consistency(&self) -> bool {
        let mut expected = self.start;
        let mut previous: Option<&MemoryBlock> = None;

        for (&key, &slot) in &self.tree {
            let Some(block) = self.slab.get(slot) else {
                log::error!("block tree key {} points at an empty slot", key);
                return false;
            };
            if key != block.address() || block.address() != expected {
                log::error!("block tree gap or overlap at {} (expected {})", key, expected);
                return false;
            }
            if block.num_pages() == 0 || !block.address().is_page_aligned() {
                log::error!("malformed block at {}", block.address());
                return false;
            }
            if let Some(previous) = previous {
                if previous.has_same_properties(block) {
                    log::error!("uncoalesced neighbours at {}", block.address());
                    return false;
                }
            }
            let device_shared = block.attribute().contains(MemoryAttribute::DEVICE_SHARED);
            if device_shared != (block.device_use_count() > 0) {
                log::error!("device share count out of sync at {}", block.address());
                return false;
            }
            let ipc_locked = block.attribute().contains(MemoryAttribute::IPC_LOCKED);
            if ipc_locked != (block.ipc_lock_count() > 0) {
                log::error!("IPC lock count out of sync at {}", block.address());
                return false;
            }

            expected = block.end_address();
            previous = Some(block);
        }

        if expected != self.end {
            log::error!("block tree ends at {} instead of {}", expected, self.end);
            return false;
        }
        self.slab.len() == self.tree.len()
    }

    pub(super) fn slab_mut(&mut self) -> &mut Slab<MemoryBlock> {
        &mut self.slab
    }

    /// Apply `mutate` to the part of every block in the range accepted by
    /// `filter`, then coalesce around the range
    pub(super) fn apply_range<P, M>(
        &mut self,
        reserved: &mut ReservedSlots,
        addr: VirtAddr,
        num_pages: u64,
        mut filter: P,
        mut mutate: M,
    ) where
        P: FnMut(&MemoryBlock) -> bool,
        M: FnMut(&mut MemoryBlock),
    {
        let end = addr + bytes_of(num_pages);
        assert!(addr.is_page_aligned(), "unaligned update at {}", addr);
        assert!(
            num_pages > 0 && self.start <= addr && end <= self.end,
            "update {}..{} outside managed range",
            addr,
            end
        );

        let available = reserved.len();
        let mut cursor = match self.find_key(addr) {
            Some(key) => key,
            None => panic!("no block contains {}", addr),
        };

        loop {
            let slot = self.tree[&cursor];
            let (block_start, block_end) = {
                let block = &self.slab[slot];
                (block.address(), block.end_address())
            };

            if filter(&self.slab[slot]) {
                let target_start = block_start.max(addr);
                let mut target = slot;

                if block_start < addr {
                    let head = self.slab[slot].split(addr);
                    let head_slot = Self::take_reserved(reserved);
                    self.slab.fill(head_slot, head);
                    self.tree.insert(block_start, head_slot);
                    self.tree.insert(addr, slot);
                }

                if end < block_end {
                    let middle = self.slab[slot].split(end);
                    let middle_slot = Self::take_reserved(reserved);
                    self.slab.fill(middle_slot, middle);
                    self.tree.insert(target_start, middle_slot);
                    self.tree.insert(end, slot);
                    target = middle_slot;
                }

                mutate(&mut self.slab[target]);
            }

            if block_end >= end {
                break;
            }
            cursor = block_end;
        }

        debug_assert!(available - reserved.len() <= MAX_BLOCKS_PER_UPDATE);
        self.coalesce(addr, end);

        #[cfg(feature = "audit")]
        assert!(self.check_consistency(), "block tree inconsistent after update");
    }

    fn take_reserved(reserved: &mut ReservedSlots) -> SlotId {
        match reserved.pop() {
            Some(slot) => slot,
            None => panic!("block update needed more nodes than reserved"),
        }
    }

    /// Merge equal neighbours whose shared boundary lies in `[addr, end]`
    fn coalesce(&mut self, addr: VirtAddr, end: VirtAddr) {
        let lookup = if addr > self.start { addr - 1 } else { addr };
        let Some(mut key) = self.find_key(lookup) else {
            return;
        };

        loop {
            let slot = self.tree[&key];
            let boundary = self.slab[slot].end_address();
            if boundary >= self.end || boundary > end {
                break;
            }

            let next_slot = self.tree[&boundary];
            if self.slab[slot].has_same_properties(&self.slab[next_slot]) {
                self.tree.remove(&boundary);
                let next = self.slab.remove(next_slot);
                self.slab[slot].add_pages(next.num_pages());
            } else {
                key = boundary;
            }
        }
    }

    fn find_key(&self, addr: VirtAddr) -> Option<VirtAddr> {
        let (&key, &slot) = self.tree.range(..=addr).next_back()?;
        self.slab[slot].contains(addr).then_some(key)
    }

    fn find_slot(&self, addr: VirtAddr) -> Option<SlotId> {
        self.find_key(addr).map(|key| self.tree[&key])
    }
}
