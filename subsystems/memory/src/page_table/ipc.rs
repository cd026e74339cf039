//! IPC buffer locking and server-side mappings
//!
//! A client buffer is locked in place for the duration of a request: the
//! first lock narrows its permission and saves the original one in the
//! block, later locks only bump the count. The server sees the same pages
//! through a fresh mapping in its alias region.

use super::{check_memory_state, Operation, PageTable, StateFilter};
use crate::physical::PageGroup;
use crate::{bytes_of, pages_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use alloc::vec::Vec;
use tessera_hal::VirtAddr;

/// A protection change applied to part of a buffer
#[derive(Debug, Clone, Copy)]
struct Reprotect {
    addr: VirtAddr,
    num_pages: u64,
    from: MemoryPermission,
    to: MemoryPermission,
}

impl PageTable {
    /// Apply protection changes in order, undoing the applied prefix on failure
    fn reprotect_all(&self, changes: &[Reprotect]) -> MemResult<()> {
        for (index, change) in changes.iter().enumerate() {
            if let Err(err) = self.operate(change.addr, change.num_pages, change.to, Operation::ChangePermissions) {
                for done in &changes[..index] {
                    if let Err(undo) = self.operate(done.addr, done.num_pages, done.from, Operation::ChangePermissions) {
                        log::error!("ipc: failed to restore {}: {}", done.addr, undo);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Lock a client buffer for an IPC transfer
    ///
    /// `perm` is the access the server gets. Returns the pages backing the
    /// buffer so the caller can map them on the server side.
    pub fn setup_for_ipc_client(
        &self,
        addr: VirtAddr,
        size: u64,
        perm: MemoryPermission,
        state: MemoryState,
    ) -> MemResult<PageGroup> {
        let source_flag = state.ipc_source_flag().ok_or(MemError::InvalidState)?;
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);
        let end = addr + size;

        let (test_perm, lock_perm) = if perm.contains(MemoryPermission::USER_WRITE) {
            (
                MemoryPermission::USER_READ_WRITE,
                MemoryPermission::KERNEL_READ_WRITE | MemoryPermission::NOT_MAPPED,
            )
        } else {
            (MemoryPermission::USER_READ, MemoryPermission::USER_READ)
        };

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                source_flag,
                source_flag,
                test_perm,
                test_perm,
                MemoryAttribute::LOCKED | MemoryAttribute::UNCACHED,
                MemoryAttribute::NONE,
            ),
        )?;

        let mut changes = Vec::new();
        for block in st.blocks.iter_range(addr, end) {
            if block.ipc_lock_count() == u16::MAX {
                return Err(MemError::LimitReached);
            }
            if block.ipc_lock_count() > 0 {
                continue;
            }
            let from = block.permission();
            let to = (lock_perm & MemoryPermission::IPC_LOCK_CHANGE_MASK)
                | (from - MemoryPermission::IPC_LOCK_CHANGE_MASK);
            if to != from {
                let start = block.address().max(addr);
                let stop = block.end_address().min(end);
                changes.push(Reprotect {
                    addr: start,
                    num_pages: pages_of(stop - start),
                    from,
                    to,
                });
            }
        }

        let group = self.page_group_of(addr, num_pages);
        let mut alloc = st.blocks.update_allocator()?;
        self.reprotect_all(&changes)?;

        alloc.update_lock(
            addr,
            num_pages,
            |block, lock_perm| {
                let locked = block.lock_for_ipc(lock_perm);
                assert!(locked.is_ok(), "IPC lock count overflow after pre-check");
            },
            lock_perm,
        );

        log::trace!("ipc: client buffer {} locked ({} pages, {:?})", addr, num_pages, perm);
        Ok(group)
    }

    /// Drop one IPC lock on a client buffer
    ///
    /// The saved permission comes back when the last lock goes away.
    pub fn cleanup_for_ipc_client(&self, addr: VirtAddr, size: u64, state: MemoryState) -> MemResult<()> {
        let source_flag = state.ipc_source_flag().ok_or(MemError::InvalidState)?;
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);
        let end = addr + size;

        let mut guard = self.general_lock.lock();
        let st = &mut *guard;
        check_memory_state(
            &st.blocks,
            addr,
            size,
            &StateFilter::new(
                source_flag,
                source_flag,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::LOCKED | MemoryAttribute::UNCACHED | MemoryAttribute::IPC_LOCKED,
                MemoryAttribute::IPC_LOCKED,
            ),
        )?;

        let changes: Vec<Reprotect> = st
            .blocks
            .iter_range(addr, end)
            .filter(|block| block.ipc_lock_count() == 1 && block.permission() != block.original_permission())
            .map(|block| {
                let start = block.address().max(addr);
                let stop = block.end_address().min(end);
                Reprotect {
                    addr: start,
                    num_pages: pages_of(stop - start),
                    from: block.permission(),
                    to: block.original_permission(),
                }
            })
            .collect();

        let mut alloc = st.blocks.update_allocator()?;
        self.reprotect_all(&changes)?;

        alloc.update_lock(
            addr,
            num_pages,
            |block, _| {
                let unlocked = block.unlock_for_ipc();
                assert!(unlocked.is_ok(), "IPC unlock of a block that passed the filter");
            },
            MemoryPermission::NONE,
        );

        log::trace!("ipc: client buffer {} unlocked ({} pages)", addr, num_pages);
        Ok(())
    }

    /// Map a client's buffer pages into this table's alias region
    pub fn setup_for_ipc_server(
        &self,
        group: &PageGroup,
        perm: MemoryPermission,
        state: MemoryState,
    ) -> MemResult<VirtAddr> {
        if !state.is_ipc() {
            return Err(MemError::InvalidState);
        }
        let alias = self.layout.alias;
        self.map_pages_in_region(group, alias.start, pages_of(alias.size()), state, perm)
    }

    /// Remove a server-side IPC mapping
    pub fn cleanup_for_ipc_server(&self, addr: VirtAddr, size: u64, state: MemoryState) -> MemResult<()> {
        if !state.is_ipc() {
            return Err(MemError::InvalidState);
        }
        self.validate_range(addr, size)?;
        let num_pages = pages_of(size);

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

        let group = self.page_group_of(addr, num_pages);
        let mut alloc = st.blocks.update_allocator()?;
        self.operate(addr, num_pages, MemoryPermission::NONE, Operation::Unmap)?;
        alloc.update(addr, num_pages, MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
        self.collaborators.allocator.close(&group);

        log::trace!("ipc: server mapping {} removed ({} bytes)", addr, bytes_of(num_pages));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::fixture;
    use crate::{bytes_of, MemError, MemoryAttribute, MemoryPermission, MemoryState};
    use tessera_hal::mmu::MemoryBacking;

    #[test]
    fn test_client_server_roundtrip() {
        let fx = fixture();
        let table = &fx.table;
        table.set_max_heap_size(bytes_of(4));
        let buffer = table.set_heap_size(bytes_of(4)).unwrap();
        table.write_block(buffer, b"request").unwrap();

        let group = table
            .setup_for_ipc_client(buffer, bytes_of(2), MemoryPermission::USER_READ_WRITE, MemoryState::IPC)
            .unwrap();
        let client = table.query_info(buffer);
        assert_eq!(
            client.permission,
            MemoryPermission::KERNEL_READ_WRITE | MemoryPermission::NOT_MAPPED
        );
        assert_eq!(client.attribute, MemoryAttribute::IPC_LOCKED);
        assert_eq!(client.ipc_lock_count, 1);
        assert_eq!(client.size, bytes_of(2));

        let server = table
            .setup_for_ipc_server(&group, MemoryPermission::USER_READ_WRITE, MemoryState::IPC)
            .unwrap();
        assert!(table.is_inside_alias_region(server, bytes_of(2)));
        assert_eq!(fx.heap.refcount(fx.mmu.translate(buffer).unwrap()), 2);

        let mut buf = [0u8; 7];
        table.read_block(server, &mut buf).unwrap();
        assert_eq!(&buf, b"request");

        table.cleanup_for_ipc_server(server, bytes_of(2), MemoryState::IPC).unwrap();
        assert_eq!(fx.heap.refcount(fx.mmu.translate(buffer).unwrap()), 1);
        table.cleanup_for_ipc_client(buffer, bytes_of(2), MemoryState::IPC).unwrap();

        let restored = table.query_info(buffer);
        assert_eq!(restored.permission, MemoryPermission::USER_READ_WRITE);
        assert_eq!(restored.attribute, MemoryAttribute::NONE);
        assert_eq!(restored.size, bytes_of(4));
        assert!(table.check_consistency());
    }

    #[test]
    fn test_locked_buffer_blocks_heap_shrink() {
        let fx = fixture();
        let table = &fx.table;
        table.set_max_heap_size(bytes_of(2));
        let buffer = table.set_heap_size(bytes_of(2)).unwrap();

        table
            .setup_for_ipc_client(buffer, bytes_of(1), MemoryPermission::USER_READ, MemoryState::IPC)
            .unwrap();
        assert_eq!(table.set_heap_size(0), Err(MemError::InvalidCurrentMemory));

        table.cleanup_for_ipc_client(buffer, bytes_of(1), MemoryState::IPC).unwrap();
        table.set_heap_size(0).unwrap();
    }

    #[test]
    fn test_read_locks_stack() {
        let fx = fixture();
        let table = &fx.table;
        table.set_max_heap_size(bytes_of(1));
        let buffer = table.set_heap_size(bytes_of(1)).unwrap();
        let size = bytes_of(1);

        for _ in 0..2 {
            table
                .setup_for_ipc_client(buffer, size, MemoryPermission::USER_READ, MemoryState::NON_SECURE_IPC)
                .unwrap();
        }
        let info = table.query_info(buffer);
        assert_eq!(info.ipc_lock_count, 2);
        assert_eq!(info.permission, MemoryPermission::USER_READ);

        // A writable request needs the write bit the first lock took away
        assert_eq!(
            table.setup_for_ipc_client(buffer, size, MemoryPermission::USER_READ_WRITE, MemoryState::IPC),
            Err(MemError::InvalidCurrentMemory)
        );

        table.cleanup_for_ipc_client(buffer, size, MemoryState::NON_SECURE_IPC).unwrap();
        assert_eq!(table.query_info(buffer).permission, MemoryPermission::USER_READ);
        table.cleanup_for_ipc_client(buffer, size, MemoryState::NON_SECURE_IPC).unwrap();
        assert_eq!(table.query_info(buffer).permission, MemoryPermission::USER_READ_WRITE);

        assert_eq!(
            table.cleanup_for_ipc_client(buffer, size, MemoryState::NON_SECURE_IPC),
            Err(MemError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn test_non_ipc_states_rejected() {
        let fx = fixture();
        let table = &fx.table;
        table.set_max_heap_size(bytes_of(1));
        let buffer = table.set_heap_size(bytes_of(1)).unwrap();
        assert_eq!(
            table.setup_for_ipc_client(buffer, bytes_of(1), MemoryPermission::USER_READ, MemoryState::NORMAL),
            Err(MemError::InvalidState)
        );
        assert_eq!(
            table.cleanup_for_ipc_server(table.alias_region_start(), bytes_of(1), MemoryState::STACK),
            Err(MemError::InvalidState)
        );
    }
}
