//! Stack aliases of heap memory

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::guard::ScopeExit;
use crate::{pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use tessera_hal::VirtAddr;

impl PageTable {
    /// Mirror aliasable memory at `src` into the stack region at `dst`
    pub fn map_memory(&self, dst: VirtAddr, src: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(src, size)?;
        self.validate_range(dst, size)?;
        if !self.can_contain(dst, size, MemoryState::STACK) {
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
                MemoryState::FLAG_CAN_ALIAS,
                MemoryState::FLAG_CAN_ALIAS,
                MemoryPermission::ALL,
                MemoryPermission::USER_READ_WRITE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
            ),
        )?;
        check_memory_state(&st.blocks, dst, size, &StateFilter::free())?;

        let group = self.page_group_of(src, num_pages);
        let mut alloc = st.blocks.update_allocator_for(2)?;
        {
            let restore = ScopeExit::new(|| {
                if let Err(err) = self.operate(src, num_pages, source.permission, Operation::ChangePermissions) {
                    log::error!("alias: failed to restore {}: {}", src, err);
                }
            });
            self.operate(src, num_pages, MemoryPermission::NONE, Operation::ChangePermissions)?;
            self.operate(dst, num_pages, MemoryPermission::USER_READ_WRITE, Operation::MapGroup(&group))?;
            restore.cancel();
        }

        alloc.update(src, num_pages, source.state, MemoryPermission::NONE, MemoryAttribute::LOCKED);
        alloc.update(
            dst,
            num_pages,
            MemoryState::STACK,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        );
        self.collaborators.allocator.open(&group);

        log::debug!("alias: {} mirrored at {} ({} pages)", src, dst, num_pages);
        Ok(())
    }

    /// Undo [`map_memory`](Self::map_memory)
    ///
    /// Both ranges must still be backed by the same physical pages.
    pub fn unmap_memory(&self, dst: VirtAddr, src: VirtAddr, size: u64) -> MemResult<()> {
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
                MemoryState::FLAG_CAN_ALIAS,
                MemoryState::FLAG_CAN_ALIAS,
                MemoryPermission::ALL,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::LOCKED,
            ),
        )?;
        let mirror = check_memory_state(
            &st.blocks,
            dst,
            size,
            &StateFilter::new(
                MemoryState::ALL,
                MemoryState::STACK,
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
            let remap = ScopeExit::new(|| {
                if let Err(err) = self.operate(dst, num_pages, mirror.permission, Operation::MapGroup(&group)) {
                    log::error!("alias: failed to remap {}: {}", dst, err);
                }
            });
            self.operate(dst, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
            self.operate(src, num_pages, MemoryPermission::USER_READ_WRITE, Operation::ChangePermissions)?;
            remap.cancel();
        }

        alloc.update(
            src,
            num_pages,
            source.state,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        );
        alloc.update(dst, num_pages, MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
        self.collaborators.allocator.close(&group);

        log::debug!("alias: dropped mirror {} of {} ({} pages)", dst, src, num_pages);
        Ok(())
    }
}
