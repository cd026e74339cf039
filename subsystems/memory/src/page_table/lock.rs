//! Protection changes and lock/unlock pairs
//!
//! Each lock sets an attribute bit that blocks reclassification of the
//! range until the matching unlock clears it.

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::physical::PageGroup;
use crate::{pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState, SvcMemoryPermission};
use tessera_hal::VirtAddr;

impl PageTable {
    /// Change the user permission of a reprotectable range
    pub fn set_memory_permission(&self, addr: VirtAddr, size: u64, svc_perm: SvcMemoryPermission) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_REPROTECT,
                MemoryState::FLAG_CAN_REPROTECT,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::all(),
                MemoryAttribute::NONE,
            ),
        )?;

        let new_perm = MemoryPermission::from(svc_perm);
        if current.permission == new_perm {
            return Ok(());
        }

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, new_perm, Operation::ChangePermissions)?;
        alloc.update(addr, num_pages, current.state, new_perm, MemoryAttribute::NONE);
        Ok(())
    }

    /// Set or clear the settable attribute bits selected by `mask`
    pub fn set_memory_attribute(
        &self,
        addr: VirtAddr,
        size: u64,
        mask: MemoryAttribute,
        attr: MemoryAttribute,
    ) -> MemResult<()> {
        if !MemoryAttribute::SET_MASK.contains(mask) || !mask.contains(attr) {
            return Err(MemError::InvalidState);
        }
        self.validate_range(addr, size)?;
        if mask.is_empty() {
            return Ok(());
        }
        let num_pages = pages_of(size);
        let tolerated = MemoryAttribute::SET_MASK | MemoryAttribute::DEVICE_SHARED;

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_CHANGE_ATTRIBUTE,
                MemoryState::FLAG_CAN_CHANGE_ATTRIBUTE,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::all() - tolerated,
                MemoryAttribute::NONE,
            )
            .ignoring(tolerated),
        )?;

        let new_attr = (current.attribute - mask) | (attr & mask);
        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, current.permission, Operation::ChangePermissionsAndRefresh)?;
        alloc.update(addr, num_pages, current.state, current.permission, new_attr);
        Ok(())
    }

    /// Take one device-share reference on every block of the range
    pub fn lock_for_device_address_space(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_DEVICE_MAP,
                MemoryState::FLAG_CAN_DEVICE_MAP,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::LOCKED_AND_IPC_LOCKED,
                MemoryAttribute::NONE,
            )
            .ignoring(MemoryAttribute::DEVICE_SHARED_AND_UNCACHED),
        )?;

        if st
            .blocks
            .iter_range(addr, addr + size)
            .any(|block| block.device_use_count() == u16::MAX)
        {
            return Err(MemError::LimitReached);
        }

        let mut alloc = st.blocks.update_allocator()?;
        alloc.update_lock(
            addr,
            num_pages,
            |block, _| {
                let shared = block.share_to_device();
                assert!(shared.is_ok(), "device share count overflow after pre-check");
            },
            MemoryPermission::NONE,
        );
        Ok(())
    }

    /// Drop one device-share reference on every block of the range
    pub fn unlock_for_device_address_space(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_DEVICE_MAP,
                MemoryState::FLAG_CAN_DEVICE_MAP,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::LOCKED_AND_IPC_LOCKED | MemoryAttribute::DEVICE_SHARED,
                MemoryAttribute::DEVICE_SHARED,
            )
            .ignoring(MemoryAttribute::DEVICE_SHARED_AND_UNCACHED),
        )?;

        let mut alloc = st.blocks.update_allocator()?;
        alloc.update_lock(
            addr,
            num_pages,
            |block, _| {
                let unshared = block.unshare_to_device();
                assert!(unshared.is_ok(), "device share count underflow after check");
            },
            MemoryPermission::NONE,
        );
        Ok(())
    }

    /// Pin heap memory for a code-memory object
    ///
    /// The range becomes kernel-only and locked, and the pages gain a
    /// reference that [`unlock_for_code_memory`](Self::unlock_for_code_memory)
    /// drops.
    pub fn lock_for_code_memory(&self, addr: VirtAddr, size: u64) -> MemResult<PageGroup> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);
        let locked_perm = MemoryPermission::NOT_MAPPED | MemoryPermission::KERNEL_READ_WRITE;

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_CODE_MEMORY,
                MemoryState::FLAG_CAN_CODE_MEMORY,
                MemoryPermission::ALL,
                MemoryPermission::USER_READ_WRITE,
                MemoryAttribute::all(),
                MemoryAttribute::NONE,
            ),
        )?;

        let group = self.page_group_of(addr, num_pages);
        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, locked_perm, Operation::ChangePermissions)?;
        alloc.update(addr, num_pages, current.state, locked_perm, MemoryAttribute::LOCKED);
        self.collaborators.allocator.open(&group);
        Ok(group)
    }

    /// Undo [`lock_for_code_memory`](Self::lock_for_code_memory)
    pub fn unlock_for_code_memory(&self, addr: VirtAddr, size: u64, group: &PageGroup) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_CODE_MEMORY,
                MemoryState::FLAG_CAN_CODE_MEMORY,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::all(),
                MemoryAttribute::LOCKED,
            ),
        )?;
        if self.page_group_of(addr, num_pages) != *group {
            return Err(MemError::InvalidMemoryRegion);
        }

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, MemoryPermission::USER_READ_WRITE, Operation::ChangePermissions)?;
        alloc.update(
            addr,
            num_pages,
            current.state,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        );
        self.collaborators.allocator.close(group);
        Ok(())
    }

    /// Lock a range backing a transfer-memory object and apply `perm`
    pub fn reserve_transfer_memory(&self, addr: VirtAddr, size: u64, perm: MemoryPermission) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);
        let transferable = MemoryState::FLAG_CAN_TRANSFER | MemoryState::FLAG_REFERENCE_COUNTED;

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                transferable,
                transferable,
                MemoryPermission::ALL,
                MemoryPermission::USER_READ_WRITE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
            ),
        )?;

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, perm, Operation::ChangePermissions)?;
        alloc.update(
            addr,
            num_pages,
            current.state,
            perm,
            current.attribute | MemoryAttribute::LOCKED,
        );
        Ok(())
    }

    /// Undo [`reserve_transfer_memory`](Self::reserve_transfer_memory)
    pub fn reset_transfer_memory(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);
        let transferable = MemoryState::FLAG_CAN_TRANSFER | MemoryState::FLAG_REFERENCE_COUNTED;

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        let current = check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                transferable,
                transferable,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::LOCKED,
            ),
        )?;

        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, MemoryPermission::USER_READ_WRITE, Operation::ChangePermissions)?;
        alloc.update(
            addr,
            num_pages,
            current.state,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        );
        Ok(())
    }
}
