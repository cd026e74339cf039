//! Memory shared between two address spaces
//!
//! A process may view another process's code through a SharedCode mapping
//! built from the source pages. Tearing that view down checks both tables,
//! but only ever holds one table lock at a time, so a table may name itself
//! as the source.

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::physical::PageGroup;
use crate::{pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use tessera_hal::{VirtAddr, PAGE_SIZE};

impl PageTable {
    /// Pages backing a range another process may map
    fn process_mappable_pages(&self, addr: VirtAddr, size: u64) -> MemResult<PageGroup> {
        self.validate_range(addr, size)?;
        let guard = self.general_lock.lock();
        check_memory_state(
            &guard.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_MAP_PROCESS,
                MemoryState::FLAG_CAN_MAP_PROCESS,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::all(),
                MemoryAttribute::NONE,
            ),
        )?;
        Ok(self.page_group_of(addr, pages_of(size)))
    }

    /// Remove a SharedCode view of `src_table`'s memory at `src_addr`
    ///
    /// The view must still be backed by exactly the source pages.
    pub fn unmap_process_memory(
        &self,
        dst: VirtAddr,
        size: u64,
        src_table: &PageTable,
        src_addr: VirtAddr,
    ) -> MemResult<()> {
        self.validate_range(dst, size)?;
        let src_group = src_table.process_mappable_pages(src_addr, size)?;
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(
            &st.blocks,
            dst,
            size,
            &StateFilter::new(
                MemoryState::ALL,
                MemoryState::SHARED_CODE,
                MemoryPermission::USER_READ_WRITE,
                MemoryPermission::USER_READ_WRITE,
                MemoryAttribute::all(),
                MemoryAttribute::NONE,
            ),
        )?;
        if self.page_group_of(dst, num_pages) != src_group {
            return Err(MemError::InvalidMemoryRegion);
        }

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(dst, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
        alloc.update(dst, num_pages, MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
        self.collaborators.allocator.close(&src_group);

        log::debug!("process: unmapped {} pages of shared code at {}", num_pages, dst);
        Ok(())
    }

    /// Whether any page of the range is in use
    ///
    /// Ranges that fail validation count as mapped.
    pub fn is_region_mapped(&self, addr: VirtAddr, size: u64) -> bool {
        self.check_memory_state(addr, size, &StateFilter::free()).is_err()
    }

    /// Whether the range is backed by one run of consecutive physical pages
    pub fn is_region_contiguous(&self, addr: VirtAddr, size: u64) -> bool {
        if self.validate_range(addr, size).is_err() {
            return false;
        }
        let backing = &*self.collaborators.backing;
        let _guard = self.general_lock.lock();

        let Some(first) = backing.translate(addr) else {
            return false;
        };
        (1..pages_of(size)).all(|index| {
            let offset = index * PAGE_SIZE;
            backing.translate(addr + offset) == Some(first + offset)
        })
    }
}
