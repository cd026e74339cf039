//! Heap growth and shrinking

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::guard::ScopeExit;
use crate::resource_limit::{LimitableResource, ScopedResourceReservation};
use crate::{pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use tessera_hal::{VirtAddr, PAGE_SIZE};

impl PageTable {
    /// Grow or shrink the heap to exactly `size` bytes
    ///
    /// Growth is charged against the physical memory quota and the new
    /// pages are zeroed. Returns the heap base.
    pub fn set_heap_size(&self, size: u64) -> MemResult<VirtAddr> {
        if size % PAGE_SIZE != 0 {
            return Err(MemError::InvalidSize);
        }
        let heap = self.layout.heap;
        // Growth drops the general lock to allocate; concurrent resizes queue here
        let _serial = self.map_physical_memory_lock.lock();

        let (grow_at, grow_size) = {
            let mut guard = self.general_lock.lock();
            let st = &mut *guard;

            if self.is_kernel || size > heap.size() || size > st.max_heap_size {
                return Err(MemError::OutOfMemory);
            }

            let current = st.current_heap_end - heap.start;
            if size == current {
                return Ok(heap.start);
            }

            if size < current {
                let addr = heap.start + size;
                let shrink = current - size;
                let num_pages = pages_of(shrink);

                check_memory_state(
                    &st.blocks,
                    addr,
                    shrink,
                    &StateFilter::new(
                        MemoryState::ALL,
                        MemoryState::NORMAL,
                        MemoryPermission::ALL,
                        MemoryPermission::USER_READ_WRITE,
                        MemoryAttribute::all(),
                        MemoryAttribute::NONE,
                    ),
                )?;

                let group = self.page_group_of(addr, num_pages);
                let mut alloc = st.blocks.update_allocator()?;
                self.operate(addr, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
                self.collaborators.allocator.close(&group);
                self.collaborators
                    .resource_limit
                    .release(LimitableResource::PhysicalMemory, shrink);

                alloc.update(
                    addr,
                    num_pages,
                    MemoryState::FREE,
                    MemoryPermission::NONE,
                    MemoryAttribute::NONE,
                );
                drop(alloc);
                st.current_heap_end = addr;

                log::debug!("heap: shrunk by {:#x} to {:#x}", shrink, size);
                return Ok(heap.start);
            }

            (st.current_heap_end, size - current)
        };

        // Allocate with the lock dropped
        let reservation = ScopedResourceReservation::new(
            &*self.collaborators.resource_limit,
            LimitableResource::PhysicalMemory,
            grow_size,
        );
        if !reservation.succeeded() {
            log::debug!("heap: quota refused {:#x} more bytes", grow_size);
            return Err(MemError::LimitReached);
        }

        let num_pages = pages_of(grow_size);
        let allocator = &*self.collaborators.allocator;
        let group = allocator.allocate_and_open(num_pages, self.pool, self.direction)?;
        let release_pages = ScopeExit::new(|| allocator.close(&group));

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        assert_eq!(grow_at, st.current_heap_end, "heap end moved while growing");

        check_memory_state(&st.blocks, grow_at, grow_size, &StateFilter::free())?;

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(grow_at, num_pages, MemoryPermission::USER_READ_WRITE, Operation::MapGroup(&group))?;
        if let Err(err) = self.collaborators.backing.zero_fill(grow_at, grow_size) {
            self.operate(grow_at, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
            return Err(err.into());
        }

        reservation.commit();
        release_pages.cancel();

        alloc.update(
            grow_at,
            num_pages,
            MemoryState::NORMAL,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        );
        drop(alloc);
        st.current_heap_end = heap.start + size;

        log::debug!("heap: grown by {:#x} to {:#x}", grow_size, size);
        Ok(heap.start)
    }

    /// Set the ceiling for [`set_heap_size`](Self::set_heap_size)
    pub fn set_max_heap_size(&self, size: u64) {
        self.general_lock.lock().max_heap_size = size;
    }
}
