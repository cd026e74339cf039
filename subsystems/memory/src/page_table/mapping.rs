//! Free-area placement and general page mappings

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::guard::ScopeExit;
use crate::physical::PageGroup;
use crate::virtual_memory::MemoryBlockManager;
use crate::{bytes_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use tessera_hal::{PhysAddr, VirtAddr, PAGE_SIZE};

/// Guard pages around user mappings
const USER_GUARD_PAGES: u64 = 4;

/// Guard pages around kernel mappings
const KERNEL_GUARD_PAGES: u64 = 1;

/// Direct placement attempts before falling back to a scan
const ASLR_ATTEMPTS: usize = 8;

impl PageTable {
    pub(super) fn guard_pages(&self) -> u64 {
        if self.is_kernel {
            KERNEL_GUARD_PAGES
        } else {
            USER_GUARD_PAGES
        }
    }

    /// Pick a free placement in the region
    ///
    /// With ASLR on, a handful of random candidates are tried first, then a
    /// first-fit scan from a random offset. The plain first-fit scan from
    /// the region start is the last resort.
    pub(super) fn find_free_area(
        &self,
        blocks: &MemoryBlockManager,
        region_start: VirtAddr,
        region_num_pages: u64,
        num_pages: u64,
        alignment: u64,
        offset: u64,
        guard_pages: u64,
    ) -> Option<VirtAddr> {
        let needed = num_pages.checked_add(guard_pages)?;

        if self.aslr && region_num_pages > needed {
            let random = &*self.collaborators.random;
            let slack = region_num_pages - needed;
            let region_last = region_start + (bytes_of(region_num_pages) - 1);

            for _ in 0..ASLR_ATTEMPTS {
                let random_offset = random.generate_random_range(0, bytes_of(slack) / alignment) * alignment;
                let candidate = (region_start + random_offset).align_down(alignment) + offset;

                let Some(block) = blocks.find_block(candidate) else {
                    continue;
                };
                if block.state() != MemoryState::FREE {
                    continue;
                }
                // The leading guard must sit inside both the region and the free block
                let Some(guard_start) = candidate.as_u64().checked_sub(bytes_of(guard_pages)) else {
                    continue;
                };
                if guard_start < region_start.as_u64() || guard_start < block.address().as_u64() {
                    continue;
                }
                let Some(candidate_end) = candidate.checked_add(bytes_of(needed)) else {
                    continue;
                };
                let candidate_last = candidate_end - 1;
                if candidate_last > block.last_address() || candidate_last > region_last {
                    continue;
                }
                return Some(candidate);
            }

            let offset_pages = random.generate_random_range(0, slack);
            let found = blocks.find_free_area(
                region_start + bytes_of(offset_pages),
                region_num_pages - offset_pages,
                num_pages,
                alignment,
                offset,
                guard_pages,
            );
            if found.is_some() {
                return found;
            }
        }

        blocks.find_free_area(region_start, region_num_pages, num_pages, alignment, offset, guard_pages)
    }

    /// Place and map `num_pages` pages somewhere in a region
    ///
    /// With `is_map_only` the caller-provided physical range is mapped;
    /// otherwise fresh pages are allocated from the table's pool.
    pub fn allocate_and_map_memory(
        &self,
        num_pages: u64,
        alignment: u64,
        is_map_only: bool,
        region_start: VirtAddr,
        region_num_pages: u64,
        state: MemoryState,
        perm: MemoryPermission,
        phys: Option<PhysAddr>,
    ) -> MemResult<VirtAddr> {
        if num_pages == 0 {
            return Err(MemError::InvalidSize);
        }
        if !alignment.is_power_of_two() || alignment < PAGE_SIZE {
            return Err(MemError::InvalidAddress);
        }
        if !self.can_contain(region_start, bytes_of(region_num_pages), state) {
            return Err(MemError::InvalidCurrentMemory);
        }
        if region_num_pages <= num_pages {
            return Err(MemError::OutOfMemory);
        }

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let addr = self
            .find_free_area(
                &st.blocks,
                region_start,
                region_num_pages,
                num_pages,
                alignment,
                0,
                self.guard_pages(),
            )
            .ok_or(MemError::OutOfMemory)?;

        let mut alloc = st.blocks.update_allocator()?;
        if is_map_only {
            let phys = phys.ok_or(MemError::InvalidState)?;
            self.operate(addr, num_pages, perm, Operation::Map(phys))?;
        } else {
            let allocator = &*self.collaborators.allocator;
            let group = allocator.allocate_and_open(num_pages, self.pool, self.direction)?;
            let release_pages = ScopeExit::new(|| allocator.close(&group));
            self.operate(addr, num_pages, perm, Operation::MapGroup(&group))?;
            release_pages.cancel();
        }

        alloc.update(addr, num_pages, state, perm, MemoryAttribute::NONE);
        log::debug!("mapping: {} pages of {} at {}", num_pages, state.name(), addr);
        Ok(addr)
    }

    /// Map an externally owned page group at `addr`
    pub fn map_pages(
        &self,
        addr: VirtAddr,
        group: &PageGroup,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> MemResult<()> {
        let num_pages = group.num_pages();
        let size = bytes_of(num_pages);
        self.validate_range(addr, size)?;
        if !self.can_contain(addr, size, state) {
            return Err(MemError::InvalidCurrentMemory);
        }

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(&st.blocks, addr, size, &StateFilter::free())?;

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, perm, Operation::MapGroup(group))?;
        alloc.update(addr, num_pages, state, perm, MemoryAttribute::NONE);
        self.collaborators.allocator.open(group);
        Ok(())
    }

    /// Unmap a page group previously mapped with [`map_pages`](Self::map_pages)
    pub fn unmap_pages(&self, addr: VirtAddr, group: &PageGroup, state: MemoryState) -> MemResult<()> {
        let num_pages = group.num_pages();
        let size = bytes_of(num_pages);
        self.validate_range(addr, size)?;
        if !self.can_contain(addr, size, state) {
            return Err(MemError::InvalidCurrentMemory);
        }

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::ALL,
                state,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
            ),
        )?;
        if self.page_group_of(addr, num_pages) != *group {
            return Err(MemError::InvalidMemoryRegion);
        }

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
        alloc.update(addr, num_pages, MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
        self.collaborators.allocator.close(group);
        Ok(())
    }

    /// Map a page group at a free placement inside a region
    pub fn map_pages_in_region(
        &self,
        group: &PageGroup,
        region_start: VirtAddr,
        region_num_pages: u64,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> MemResult<VirtAddr> {
        let num_pages = group.num_pages();
        if num_pages == 0 {
            return Err(MemError::InvalidSize);
        }
        if !self.can_contain(region_start, bytes_of(region_num_pages), state) {
            return Err(MemError::InvalidCurrentMemory);
        }
        if region_num_pages <= num_pages {
            return Err(MemError::OutOfMemory);
        }

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let addr = self
            .find_free_area(
                &st.blocks,
                region_start,
                region_num_pages,
                num_pages,
                PAGE_SIZE,
                0,
                self.guard_pages(),
            )
            .ok_or(MemError::OutOfMemory)?;

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, perm, Operation::MapGroup(group))?;
        alloc.update(addr, num_pages, state, perm, MemoryAttribute::NONE);
        self.collaborators.allocator.open(group);
        Ok(addr)
    }
}
