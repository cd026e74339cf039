//! Code image mapping, code aliases and code protection

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::guard::ScopeExit;
use crate::{
    bytes_of, pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState,
    SvcMemoryPermission,
};
use tessera_hal::VirtAddr;

impl PageTable {
    /// Map fresh pages for a code image segment
    pub fn map_process_code(
        &self,
        addr: VirtAddr,
        num_pages: u64,
        state: MemoryState,
        perm: MemoryPermission,
    ) -> MemResult<()> {
        let size = bytes_of(num_pages);
        self.validate_range(addr, size)?;
        if !self.can_contain(addr, size, state) {
            return Err(MemError::InvalidCurrentMemory);
        }

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(&st.blocks, addr, size, &StateFilter::free())?;

        let allocator = &*self.collaborators.allocator;
        let group = allocator.allocate_and_open(num_pages, self.pool, self.direction)?;
        let release_pages = ScopeExit::new(|| allocator.close(&group));

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, perm, Operation::MapGroup(&group))?;
        release_pages.cancel();

        alloc.update(addr, num_pages, state, perm, MemoryAttribute::NONE);
        log::debug!("code: mapped {} pages at {} as {}", num_pages, addr, state.name());
        Ok(())
    }

    /// Alias Normal memory at `src` into the alias code region at `dst`
    ///
    /// The source becomes inaccessible and locked until
    /// [`unmap_code_memory`](Self::unmap_code_memory) releases it.
    pub fn map_code_memory(&self, dst: VirtAddr, src: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(src, size)?;
        self.validate_range(dst, size)?;
        if !self.can_contain(dst, size, MemoryState::ALIAS_CODE) {
            return Err(MemError::InvalidMemoryRegion);
        }
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;

        let source = check_memory_state(
            &st.blocks,
            src,
            size,
            &StateFilter::new(
                MemoryState::ALL,
                MemoryState::NORMAL,
                MemoryPermission::ALL,
                MemoryPermission::USER_READ_WRITE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
            ),
        )?;
        check_memory_state(&st.blocks, dst, size, &StateFilter::free())?;

        let group = self.page_group_of(src, num_pages);
        let source_lock = MemoryPermission::KERNEL_READ | MemoryPermission::NOT_MAPPED;
        let mut alloc = st.blocks.update_allocator_for(2)?;
        {
            let restore = ScopeExit::new(|| {
                if let Err(err) = self.operate(src, num_pages, source.permission, Operation::ChangePermissions) {
                    log::error!("code: failed to restore {} after alias failure: {}", src, err);
                }
            });
            self.operate(src, num_pages, source_lock, Operation::ChangePermissions)?;
            self.operate(dst, num_pages, MemoryPermission::NONE, Operation::MapGroup(&group))?;
            restore.cancel();
        }

        alloc.update(src, num_pages, source.state, source_lock, MemoryAttribute::LOCKED);
        alloc.update(
            dst,
            num_pages,
            MemoryState::ALIAS_CODE,
            MemoryPermission::NONE,
            MemoryAttribute::NONE,
        );
        self.collaborators.allocator.open(&group);

        log::debug!("code: aliased {} -> {} ({} pages)", src, dst, num_pages);
        Ok(())
    }

    /// Undo [`map_code_memory`](Self::map_code_memory)
    ///
    /// A zero size succeeds without touching anything.
    pub fn unmap_code_memory(&self, dst: VirtAddr, src: VirtAddr, size: u64) -> MemResult<()> {
        if size == 0 {
            return Ok(());
        }
        self.validate_range(src, size)?;
        self.validate_range(dst, size)?;
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;

        let source = check_memory_state(
            &st.blocks,
            src,
            size,
            &StateFilter::new(
                MemoryState::ALL,
                MemoryState::NORMAL,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::LOCKED,
            ),
        )?;
        let alias = check_memory_state(
            &st.blocks,
            dst,
            bytes_of(1),
            &StateFilter::new(
                MemoryState::FLAG_CAN_CODE_ALIAS,
                MemoryState::FLAG_CAN_CODE_ALIAS,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
            ),
        )?;
        check_memory_state(
            &st.blocks,
            dst,
            size,
            &StateFilter::new(
                MemoryState::ALL,
                alias.state,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
            ),
        )?;

        let group = self.page_group_of(dst, num_pages);
        if group != self.page_group_of(src, num_pages) {
            return Err(MemError::InvalidMemoryRegion);
        }

        let mut alloc = st.blocks.update_allocator_for(2)?;
        {
            let relock = ScopeExit::new(|| {
                if let Err(err) = self.operate(src, num_pages, source.permission, Operation::ChangePermissions) {
                    log::error!("code: failed to relock {} after unmap failure: {}", src, err);
                }
            });
            self.operate(src, num_pages, MemoryPermission::USER_READ_WRITE, Operation::ChangePermissions)?;
            self.operate(dst, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
            relock.cancel();
        }

        alloc.update(dst, num_pages, MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
        alloc.update(
            src,
            num_pages,
            MemoryState::NORMAL,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        );
        self.collaborators.allocator.close(&group);
        self.collaborators.backing.invalidate_instruction_cache(dst, size);

        log::debug!("code: removed alias {} of {} ({} pages)", dst, src, num_pages);
        Ok(())
    }

    /// Change the protection of a code range
    ///
    /// Making code writable turns it into its data variant for good.
    /// Writable-and-executable requests are refused.
    pub fn set_process_memory_permission(
        &self,
        addr: VirtAddr,
        size: u64,
        svc_perm: SvcMemoryPermission,
    ) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);

        let new_perm = MemoryPermission::from(svc_perm);
        let is_w = new_perm.contains(MemoryPermission::USER_WRITE);
        let is_x = new_perm.contains(MemoryPermission::USER_EXECUTE);
        if is_w && is_x {
            return Err(MemError::InvalidState);
        }

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;

        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::empty(),
                MemoryState::empty(),
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::all(),
                MemoryAttribute::NONE,
            ),
        )?;

        let old_state = current.state;
        let is_code = old_state.contains(MemoryState::FLAG_CODE);
        let is_code_data = old_state == MemoryState::CODE_DATA || old_state == MemoryState::ALIAS_CODE_DATA;
        if !is_code && !is_code_data {
            return Err(MemError::InvalidCurrentMemory);
        }

        let new_state = if !is_w || is_code_data {
            old_state
        } else if old_state == MemoryState::CODE {
            MemoryState::CODE_DATA
        } else if old_state == MemoryState::ALIAS_CODE {
            MemoryState::ALIAS_CODE_DATA
        } else {
            return Err(MemError::InvalidCurrentMemory);
        };

        if current.permission == new_perm && old_state == new_state {
            return Ok(());
        }

        let was_x = current.permission.contains(MemoryPermission::USER_EXECUTE);
        let operation = if was_x {
            Operation::ChangePermissionsAndRefresh
        } else {
            Operation::ChangePermissions
        };

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, new_perm, operation)?;
        alloc.update(addr, num_pages, new_state, new_perm, MemoryAttribute::NONE);

        if is_x {
            self.collaborators.backing.invalidate_instruction_cache(addr, size);
        }

        log::debug!(
            "code: {} now {} {:?} ({} pages)",
            addr,
            new_state.name(),
            new_perm,
            num_pages
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::physical::PhysicalAllocator;
    use crate::testing::{fixture, Fixture, CODE_ADDR};
    use crate::{
        bytes_of, MemError, MemoryAttribute, MemoryPermission, MemoryState, SvcMemoryPermission,
    };
    use tessera_hal::mmu::{HostProtection, MemoryBacking};
    use tessera_hal::VirtAddr;

    fn heap_with_pages(fx: &Fixture, num_pages: u64) -> VirtAddr {
        fx.table.set_max_heap_size(bytes_of(num_pages));
        fx.table.set_heap_size(bytes_of(num_pages)).unwrap()
    }

    #[test]
    fn test_map_process_code_then_query() {
        let fx = fixture();
        fx.table
            .map_process_code(CODE_ADDR, 16, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE)
            .unwrap();

        let info = fx.table.query_info(CODE_ADDR);
        assert_eq!(info.address, CODE_ADDR);
        assert_eq!(info.state, MemoryState::CODE);
        assert_eq!(info.permission, MemoryPermission::USER_READ_EXECUTE);
        assert_eq!(info.size, bytes_of(16));
        assert_eq!(fx.mmu.entry(CODE_ADDR).unwrap().prot, HostProtection::READ | HostProtection::EXECUTE);
    }

    #[test]
    fn test_map_process_code_rejects_overlap_and_bad_region() {
        let fx = fixture();
        fx.table
            .map_process_code(CODE_ADDR, 4, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE)
            .unwrap();
        assert_eq!(
            fx.table
                .map_process_code(CODE_ADDR + bytes_of(2), 4, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE),
            Err(MemError::InvalidCurrentMemory)
        );
        assert_eq!(
            fx.table.map_process_code(
                fx.table.heap_region_start(),
                1,
                MemoryState::CODE,
                MemoryPermission::USER_READ_EXECUTE
            ),
            Err(MemError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn test_code_becomes_code_data_once() {
        let fx = fixture();
        let table = &fx.table;
        table
            .map_process_code(CODE_ADDR, 4, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE)
            .unwrap();

        table
            .set_process_memory_permission(CODE_ADDR, bytes_of(4), SvcMemoryPermission::READ_WRITE)
            .unwrap();
        let info = table.query_info(CODE_ADDR);
        assert_eq!(info.state, MemoryState::CODE_DATA);
        assert_eq!(info.permission, MemoryPermission::USER_READ_WRITE);

        let before = fx.mmu.stats().total_operations();
        table
            .set_process_memory_permission(CODE_ADDR, bytes_of(4), SvcMemoryPermission::READ_WRITE)
            .unwrap();
        assert_eq!(fx.mmu.stats().total_operations(), before);

        // Dropping write keeps the data state
        table
            .set_process_memory_permission(CODE_ADDR, bytes_of(4), SvcMemoryPermission::READ)
            .unwrap();
        let info = table.query_info(CODE_ADDR);
        assert_eq!(info.state, MemoryState::CODE_DATA);
        assert_eq!(info.permission, MemoryPermission::USER_READ);
    }

    #[test]
    fn test_executable_change_invalidates_icache() {
        let fx = fixture();
        fx.table
            .map_process_code(CODE_ADDR, 2, MemoryState::CODE, MemoryPermission::USER_READ)
            .unwrap();
        let before = fx.mmu.stats().icache_invalidations();
        fx.table
            .set_process_memory_permission(CODE_ADDR, bytes_of(2), SvcMemoryPermission::READ_EXECUTE)
            .unwrap();
        assert_eq!(fx.mmu.stats().icache_invalidations(), before + 1);
        assert_eq!(
            fx.table.set_process_memory_permission(
                CODE_ADDR,
                bytes_of(2),
                SvcMemoryPermission::READ_WRITE | SvcMemoryPermission::EXECUTE
            ),
            Err(MemError::InvalidState)
        );
    }

    #[test]
    fn test_process_permission_requires_code() {
        let fx = fixture();
        let heap = heap_with_pages(&fx, 2);
        assert_eq!(
            fx.table.set_process_memory_permission(heap, bytes_of(2), SvcMemoryPermission::READ),
            Err(MemError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn test_code_memory_alias_roundtrip() {
        let fx = fixture();
        let table = &fx.table;
        let src = heap_with_pages(&fx, 4);
        table.write_block(src, b"nro image").unwrap();
        let dst = CODE_ADDR + bytes_of(64);

        table.map_code_memory(dst, src, bytes_of(4)).unwrap();

        let source = table.query_info(src);
        assert_eq!(source.state, MemoryState::NORMAL);
        assert_eq!(source.attribute, MemoryAttribute::LOCKED);
        assert_eq!(source.permission, MemoryPermission::KERNEL_READ | MemoryPermission::NOT_MAPPED);
        let alias = table.query_info(dst);
        assert_eq!(alias.state, MemoryState::ALIAS_CODE);
        assert_eq!(fx.mmu.translate(dst), fx.mmu.translate(src));
        let page = fx.mmu.translate(src).unwrap();
        assert_eq!(fx.heap.refcount(page), 2);

        table
            .set_process_memory_permission(dst, bytes_of(4), SvcMemoryPermission::READ_EXECUTE)
            .unwrap();
        let mut buf = [0u8; 9];
        table.read_block(dst, &mut buf).unwrap();
        assert_eq!(&buf, b"nro image");

        table.unmap_code_memory(dst, src, bytes_of(4)).unwrap();
        assert_eq!(table.query_info(dst).state, MemoryState::FREE);
        let source = table.query_info(src);
        assert_eq!(source.permission, MemoryPermission::USER_READ_WRITE);
        assert_eq!(source.attribute, MemoryAttribute::NONE);
        assert_eq!(fx.heap.refcount(page), 1);
        assert!(table.check_consistency());
    }

    #[test]
    fn test_code_memory_requires_free_destination() {
        let fx = fixture();
        let src = heap_with_pages(&fx, 2);
        fx.table
            .map_process_code(CODE_ADDR, 2, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE)
            .unwrap();

        assert_eq!(
            fx.table.map_code_memory(CODE_ADDR, src, bytes_of(2)),
            Err(MemError::InvalidCurrentMemory)
        );
        assert_eq!(fx.table.query_info(src).attribute, MemoryAttribute::NONE);
    }

    #[test]
    fn test_failed_alias_restores_source() {
        let fx = fixture();
        let src = heap_with_pages(&fx, 4);
        let dst = CODE_ADDR + bytes_of(64);
        fx.mmu.inject_map_failure(1);

        assert!(fx.table.map_code_memory(dst, src, bytes_of(4)).is_err());
        let source = fx.table.query_info(src);
        assert_eq!(source.permission, MemoryPermission::USER_READ_WRITE);
        assert_eq!(source.attribute, MemoryAttribute::NONE);
        assert_eq!(fx.mmu.entry(src).unwrap().prot, HostProtection::READ | HostProtection::WRITE);
        assert!(fx.mmu.translate(dst).is_none());
        assert_eq!(fx.heap.free_pages(crate::physical::MemoryPool::Application), 4096 - 4);
    }

    #[test]
    fn test_unmap_code_memory_zero_size() {
        let fx = fixture();
        assert_eq!(fx.table.unmap_code_memory(CODE_ADDR, CODE_ADDR, 0), Ok(()));
    }
}
