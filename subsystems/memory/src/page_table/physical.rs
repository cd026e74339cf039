//! Physical memory mapped into the alias region

use super::{overlap, Operation, PageTable, TableState};
use crate::guard::ScopeExit;
use crate::physical::PageGroup;
use crate::resource_limit::{LimitableResource, ScopedResourceReservation};
use crate::virtual_memory::MemoryBlockManager;
use crate::{bytes_of, pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use alloc::vec::Vec;
use tessera_hal::VirtAddr;

/// Bytes of `[addr, end)` covered by anything but free blocks
fn mapped_size(blocks: &MemoryBlockManager, addr: VirtAddr, end: VirtAddr) -> u64 {
    blocks
        .iter_range(addr, end)
        .filter(|block| block.state() != MemoryState::FREE)
        .map(|block| overlap(block.address(), block.end_address(), addr, end))
        .sum()
}

/// Free sub-ranges of `[addr, end)` as `(start, num_pages)`
fn free_holes(blocks: &MemoryBlockManager, addr: VirtAddr, end: VirtAddr) -> Vec<(VirtAddr, u64)> {
    blocks
        .iter_range(addr, end)
        .filter(|block| block.state() == MemoryState::FREE)
        .map(|block| {
            let start = block.address().max(addr);
            (start, pages_of(overlap(block.address(), block.end_address(), addr, end)))
        })
        .collect()
}

/// A mapped stretch of the range being released
struct MappedRun {
    addr: VirtAddr,
    num_pages: u64,
    permission: MemoryPermission,
    group: PageGroup,
}

impl PageTable {
    /// Back every free page of `[addr, addr + size)` in the alias region
    /// with fresh memory
    ///
    /// Pages already mapped, whatever their state, are left alone and only
    /// the new ones are charged against the quota.
    pub fn map_physical_memory(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(addr, size)?;
        if !self.layout.alias.contains_range(addr, size) {
            return Err(MemError::InvalidMemoryRegion);
        }
        let end = addr + size;

        let _serial = self.map_physical_memory_lock.lock();
        loop {
            let mapped = mapped_size(&self.general_lock.lock().blocks, addr, end);
            if mapped == size {
                return Ok(());
            }

            let missing = size - mapped;
            let reservation = ScopedResourceReservation::new(
                &*self.collaborators.resource_limit,
                LimitableResource::PhysicalMemory,
                missing,
            );
            if !reservation.succeeded() {
                return Err(MemError::LimitReached);
            }

            let allocator = &*self.collaborators.allocator;
            let group = allocator.allocate_and_open(pages_of(missing), self.pool, self.direction)?;
            let release_pages = ScopeExit::new(|| allocator.close(&group));

            let mut guard = self.general_lock.lock();
            let st: &mut TableState = &mut guard;

            if mapped_size(&st.blocks, addr, end) != mapped {
                log::debug!("physical: {} changed while allocating, retrying", addr);
                continue;
            }

            let holes = free_holes(&st.blocks, addr, end);
            let mut alloc = st.blocks.update_allocator()?;
            self.map_holes(&holes, &group)?;

            reservation.commit();
            release_pages.cancel();

            alloc.update_if_match(
                addr,
                pages_of(size),
                MemoryState::FREE,
                MemoryPermission::NONE,
                MemoryAttribute::NONE,
                MemoryState::NORMAL,
                MemoryPermission::USER_READ_WRITE,
                MemoryAttribute::NONE,
            );
            drop(alloc);
            st.mapped_physical_memory_size += missing;

            log::debug!("physical: mapped {:#x} new bytes in {}..{}", missing, addr, end);
            return Ok(());
        }
    }

    /// Map `group` page by page over the free holes, all or nothing
    fn map_holes(&self, holes: &[(VirtAddr, u64)], group: &PageGroup) -> MemResult<()> {
        let mut pages = group.pages();
        let mut done: Vec<(VirtAddr, u64)> = Vec::new();

        let result = holes.iter().try_for_each(|&(start, num_pages)| -> MemResult<()> {
            for index in 0..num_pages {
                let page = start + bytes_of(index);
                let Some(phys) = pages.next() else {
                    panic!("page group smaller than the holes it backs");
                };
                self.operate(page, 1, MemoryPermission::USER_READ_WRITE, Operation::Map(phys))?;
                done.push((page, 1));
            }
            Ok(())
        });

        if result.is_err() {
            for &(page, num_pages) in &done {
                if let Err(err) = self.operate(page, num_pages, MemoryPermission::NONE, Operation::Unmap) {
                    log::error!("physical: failed to roll back {}: {}", page, err);
                }
            }
        }
        result
    }

    /// Unmap every run, remapping the finished ones if a later run fails
    fn unmap_runs(&self, runs: &[MappedRun]) -> MemResult<()> {
        for (index, run) in runs.iter().enumerate() {
            if let Err(err) = self.operate(run.addr, run.num_pages, MemoryPermission::NONE, Operation::Unmap) {
                for done in &runs[..index] {
                    let remap = self.operate(done.addr, done.num_pages, done.permission, Operation::MapGroup(&done.group));
                    if let Err(undo) = remap {
                        log::error!("physical: failed to restore {}: {}", done.addr, undo);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release every Normal page of `[addr, addr + size)` in the alias region
    pub fn unmap_physical_memory(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(addr, size)?;
        if !self.layout.alias.contains_range(addr, size) {
            return Err(MemError::InvalidMemoryRegion);
        }
        let end = addr + size;

        let _serial = self.map_physical_memory_lock.lock();
        let mut guard = self.general_lock.lock();
        let st: &mut TableState = &mut guard;

        let mut mapped = 0;
        let mut runs = Vec::new();
        for block in st.blocks.iter_range(addr, end) {
            if block.state() == MemoryState::FREE {
                continue;
            }
            if block.state() != MemoryState::NORMAL || block.attribute() != MemoryAttribute::NONE {
                return Err(MemError::InvalidCurrentMemory);
            }
            let start = block.address().max(addr);
            let bytes = overlap(block.address(), block.end_address(), addr, end);
            runs.push(MappedRun {
                addr: start,
                num_pages: pages_of(bytes),
                permission: block.permission(),
                group: self.page_group_of(start, pages_of(bytes)),
            });
            mapped += bytes;
        }
        if mapped == 0 {
            return Ok(());
        }

        let mut alloc = st.blocks.update_allocator()?;
        self.unmap_runs(&runs)?;
        for run in &runs {
            self.collaborators.allocator.close(&run.group);
        }

        alloc.update(addr, pages_of(size), MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
        drop(alloc);

        self.collaborators
            .resource_limit
            .release(LimitableResource::PhysicalMemory, mapped);
        st.mapped_physical_memory_size -= mapped;

        log::debug!("physical: unmapped {:#x} bytes in {}..{}", mapped, addr, end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::physical::{AllocationDirection, MemoryPool, PhysicalAllocator};
    use crate::resource_limit::{LimitableResource, ResourceLimit};
    use crate::testing::{fixture, MEMORY_LIMIT};
    use crate::{bytes_of, MemError, MemoryPermission, MemoryState, SvcMemoryPermission};
    use tessera_hal::mmu::MemoryBacking;

    #[test]
    fn test_map_fills_only_holes() {
        let fx = fixture();
        let table = &fx.table;
        let alias = table.alias_region_start();

        table.map_physical_memory(alias + bytes_of(2), bytes_of(2)).unwrap();
        assert_eq!(table.mapped_physical_memory_size(), bytes_of(2));

        let before = fx.heap.allocated_pages();
        table.map_physical_memory(alias, bytes_of(8)).unwrap();
        assert_eq!(fx.heap.allocated_pages(), before + 6);
        assert_eq!(table.mapped_physical_memory_size(), bytes_of(8));
        assert_eq!(fx.limit.current_value(LimitableResource::PhysicalMemory), bytes_of(8));
        assert_eq!(fx.mmu.mapped_pages(), 8);

        let info = table.query_info(alias);
        assert_eq!(info.state, MemoryState::NORMAL);
        assert_eq!(info.permission, MemoryPermission::USER_READ_WRITE);
        assert_eq!(info.size, bytes_of(8));
        assert_eq!(table.total_heap_size(), bytes_of(8));
    }

    #[test]
    fn test_map_fully_mapped_range_is_a_no_op() {
        let fx = fixture();
        let alias = fx.table.alias_region_start();
        fx.table.map_physical_memory(alias, bytes_of(4)).unwrap();

        let before = fx.mmu.stats().total_operations();
        fx.table.map_physical_memory(alias, bytes_of(4)).unwrap();
        assert_eq!(fx.mmu.stats().total_operations(), before);
    }

    #[test]
    fn test_unmap_releases_quota() {
        let fx = fixture();
        let alias = fx.table.alias_region_start();
        fx.table.map_physical_memory(alias, bytes_of(8)).unwrap();

        fx.table.unmap_physical_memory(alias + bytes_of(4), bytes_of(8)).unwrap();
        assert_eq!(fx.table.mapped_physical_memory_size(), bytes_of(4));
        assert_eq!(fx.limit.current_value(LimitableResource::PhysicalMemory), bytes_of(4));
        assert_eq!(fx.table.query_info(alias + bytes_of(4)).state, MemoryState::FREE);

        fx.table.unmap_physical_memory(alias, bytes_of(4)).unwrap();
        assert_eq!(fx.heap.allocated_pages(), fx.heap.freed_pages());
        assert_eq!(fx.table.block_count(), 1);
    }

    #[test]
    fn test_region_and_quota_checks() {
        let fx = fixture();
        assert_eq!(
            fx.table.map_physical_memory(fx.table.heap_region_start(), bytes_of(1)),
            Err(MemError::InvalidMemoryRegion)
        );
        assert_eq!(
            fx.table.map_physical_memory(fx.table.alias_region_start(), MEMORY_LIMIT + bytes_of(1)),
            Err(MemError::LimitReached)
        );
        assert_eq!(fx.table.mapped_physical_memory_size(), 0);
    }

    #[test]
    fn test_failed_map_rolls_back_new_pages() {
        let fx = fixture();
        let alias = fx.table.alias_region_start();
        fx.table.map_physical_memory(alias, bytes_of(1)).unwrap();

        fx.mmu.inject_map_failure(2);
        assert!(fx.table.map_physical_memory(alias, bytes_of(6)).is_err());
        assert_eq!(fx.mmu.mapped_pages(), 1);
        assert_eq!(fx.table.mapped_physical_memory_size(), bytes_of(1));
        assert_eq!(fx.limit.current_value(LimitableResource::PhysicalMemory), bytes_of(1));
        assert_eq!(fx.table.query_info(alias + bytes_of(1)).state, MemoryState::FREE);
    }

    #[test]
    fn test_concurrent_maps_converge() {
        let fx = fixture();
        let alias = fx.table.alias_region_start();

        std::thread::scope(|scope| {
            for index in 0..4 {
                let table = &fx.table;
                scope.spawn(move || {
                    table
                        .map_physical_memory(alias + bytes_of(index * 4), bytes_of(16))
                        .unwrap();
                });
            }
        });

        let expected = bytes_of(12 + 16);
        assert_eq!(fx.table.mapped_physical_memory_size(), expected);
        assert_eq!(fx.limit.current_value(LimitableResource::PhysicalMemory), expected);
        assert_eq!(fx.heap.allocated_pages() - fx.heap.freed_pages(), 12 + 16);
        assert_eq!(fx.table.query_info(alias).size, expected);
        assert!(fx.table.check_consistency());
    }

    #[test]
    fn test_map_skips_reprotected_pages() {
        let fx = fixture();
        let table = &fx.table;
        let alias = table.alias_region_start();
        table.map_physical_memory(alias, bytes_of(2)).unwrap();
        table
            .set_memory_permission(alias, bytes_of(1), SvcMemoryPermission::READ)
            .unwrap();

        table.map_physical_memory(alias, bytes_of(4)).unwrap();
        assert_eq!(table.mapped_physical_memory_size(), bytes_of(4));
        assert_eq!(fx.limit.current_value(LimitableResource::PhysicalMemory), bytes_of(4));
        assert_eq!(table.query_info(alias).permission, MemoryPermission::USER_READ);
        let tail = table.query_info(alias + bytes_of(1));
        assert_eq!(tail.state, MemoryState::NORMAL);
        assert_eq!(tail.size, bytes_of(3));
        assert!(table.check_consistency());
    }

    #[test]
    fn test_map_around_ipc_server_mapping() {
        let fx = fixture();
        let table = &fx.table;
        let group = fx
            .heap
            .allocate_and_open(2, MemoryPool::Application, AllocationDirection::FromFront)
            .unwrap();
        let server = table
            .setup_for_ipc_server(&group, MemoryPermission::USER_READ_WRITE, MemoryState::IPC)
            .unwrap();

        table.map_physical_memory(server, bytes_of(4)).unwrap();
        assert_eq!(table.mapped_physical_memory_size(), bytes_of(2));
        assert_eq!(table.query_info(server).state, MemoryState::IPC);
        assert_eq!(fx.mmu.translate(server), group.pages().next());
        assert_eq!(table.query_info(server + bytes_of(2)).state, MemoryState::NORMAL);
        assert!(table.check_consistency());
    }

    #[test]
    fn test_failed_unmap_restores_runs() {
        let fx = fixture();
        let table = &fx.table;
        let alias = table.alias_region_start();
        table.map_physical_memory(alias, bytes_of(8)).unwrap();
        table
            .set_memory_permission(alias + bytes_of(2), bytes_of(2), SvcMemoryPermission::READ)
            .unwrap();

        let phys: alloc::vec::Vec<_> = (0..8).map(|page| fx.mmu.translate(alias + bytes_of(page))).collect();
        let read_only = fx.mmu.entry(alias + bytes_of(2)).unwrap().prot;

        // Three runs; the last one fails to unmap
        fx.mmu.inject_unmap_failure(2);
        assert!(table.unmap_physical_memory(alias, bytes_of(8)).is_err());

        assert_eq!(fx.mmu.mapped_pages(), 8);
        for (page, expected) in phys.iter().enumerate() {
            let page_addr = alias + bytes_of(page as u64);
            assert_eq!(fx.mmu.translate(page_addr), *expected);
            assert_eq!(fx.heap.refcount(expected.unwrap()), 1);
        }
        assert_eq!(fx.mmu.entry(alias + bytes_of(2)).unwrap().prot, read_only);
        assert_eq!(table.mapped_physical_memory_size(), bytes_of(8));
        assert_eq!(fx.limit.current_value(LimitableResource::PhysicalMemory), bytes_of(8));
        assert_eq!(table.query_info(alias).state, MemoryState::NORMAL);

        table.unmap_physical_memory(alias, bytes_of(8)).unwrap();
        assert_eq!(fx.heap.allocated_pages(), fx.heap.freed_pages());
        assert_eq!(table.block_count(), 1);
    }

    #[test]
    fn test_unmap_rejects_foreign_state() {
        let fx = fixture();
        let alias = fx.table.alias_region_start();
        fx.table.map_physical_memory(alias, bytes_of(2)).unwrap();
        fx.table.lock_for_device_address_space(alias, bytes_of(1)).unwrap();
        assert_eq!(
            fx.table.unmap_physical_memory(alias, bytes_of(2)),
            Err(MemError::InvalidCurrentMemory)
        );
    }
}
