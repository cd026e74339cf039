//! # Memory Blocks
//!
//! A block is one classified, page-aligned range of the guest address
//! space.

use crate::{bytes_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use tessera_hal::{VirtAddr, PAGE_SIZE};

/// Attribute bits that never block a classification match
const ATTRIBUTE_IGNORE_MASK: MemoryAttribute = MemoryAttribute::DONT_CARE_MASK
    .union(MemoryAttribute::IPC_LOCKED)
    .union(MemoryAttribute::DEVICE_SHARED);

/// Attribute bits carried across an [`MemoryBlock::update`]
const ATTRIBUTE_CARRY_MASK: MemoryAttribute =
    MemoryAttribute::IPC_LOCKED.union(MemoryAttribute::DEVICE_SHARED);

/// Snapshot of a block as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Start address
    pub address: VirtAddr,
    /// Size in bytes
    pub size: u64,
    /// State
    pub state: MemoryState,
    /// Current permission
    pub permission: MemoryPermission,
    /// Attribute
    pub attribute: MemoryAttribute,
    /// Permission saved by the first IPC lock
    pub original_permission: MemoryPermission,
    /// Outstanding IPC locks
    pub ipc_lock_count: u16,
    /// Outstanding device shares
    pub device_use_count: u16,
}

impl MemoryInfo {
    /// End address (exclusive)
    pub fn end_address(&self) -> VirtAddr {
        self.address + self.size
    }

    /// Last address inside the range
    pub fn last_address(&self) -> VirtAddr {
        self.end_address() - 1
    }
}

/// A classified address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    address: VirtAddr,
    num_pages: u64,
    state: MemoryState,
    permission: MemoryPermission,
    original_permission: MemoryPermission,
    attribute: MemoryAttribute,
    ipc_lock_count: u16,
    device_use_count: u16,
}

impl MemoryBlock {
    /// Create a block with no locks held
    pub const fn new(
        address: VirtAddr,
        num_pages: u64,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) -> Self {
        Self {
            address,
            num_pages,
            state,
            permission,
            original_permission: MemoryPermission::NONE,
            attribute,
            ipc_lock_count: 0,
            device_use_count: 0,
        }
    }

    /// Start address
    pub const fn address(&self) -> VirtAddr {
        self.address
    }

    /// Number of pages
    pub const fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        bytes_of(self.num_pages)
    }

    /// End address (exclusive)
    pub fn end_address(&self) -> VirtAddr {
        self.address + self.size()
    }

    /// Last address inside the block
    pub fn last_address(&self) -> VirtAddr {
        self.end_address() - 1
    }

    /// State
    pub const fn state(&self) -> MemoryState {
        self.state
    }

    /// Current permission
    pub const fn permission(&self) -> MemoryPermission {
        self.permission
    }

    /// Permission saved by the first IPC lock
    pub const fn original_permission(&self) -> MemoryPermission {
        self.original_permission
    }

    /// Attribute
    pub const fn attribute(&self) -> MemoryAttribute {
        self.attribute
    }

    /// Outstanding IPC locks
    pub const fn ipc_lock_count(&self) -> u16 {
        self.ipc_lock_count
    }

    /// Outstanding device shares
    pub const fn device_use_count(&self) -> u16 {
        self.device_use_count
    }

    /// Whether `addr` lies inside the block
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.address <= addr && addr <= self.last_address()
    }

    /// Snapshot for callers
    pub fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            address: self.address,
            size: self.size(),
            state: self.state,
            permission: self.permission,
            attribute: self.attribute,
            original_permission: self.original_permission,
            ipc_lock_count: self.ipc_lock_count,
            device_use_count: self.device_use_count,
        }
    }

    /// Match against a classification triple, ignoring transient attributes
    pub fn has_properties(
        &self,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) -> bool {
        self.state == state
            && self.permission == permission
            && (self.attribute | ATTRIBUTE_IGNORE_MASK) == (attribute | ATTRIBUTE_IGNORE_MASK)
    }

    /// Whether two blocks may be coalesced
    ///
    /// Transient attribute bits are implied by the lock counts, which are
    /// compared directly.
    pub fn has_same_properties(&self, other: &Self) -> bool {
        self.state == other.state
            && self.permission == other.permission
            && self.original_permission == other.original_permission
            && (self.attribute | ATTRIBUTE_IGNORE_MASK) == (other.attribute | ATTRIBUTE_IGNORE_MASK)
            && self.ipc_lock_count == other.ipc_lock_count
            && self.device_use_count == other.device_use_count
    }

    /// Whether an [`update`](Self::update) with this triple would change nothing
    pub fn is_update_noop(
        &self,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) -> bool {
        self.state == state
            && self.permission == permission
            && self.attribute == (attribute | (self.attribute & ATTRIBUTE_CARRY_MASK))
    }

    /// Split at `addr`, returning the head and keeping the tail
    pub fn split(&mut self, addr: VirtAddr) -> MemoryBlock {
        assert!(self.address < addr, "split point {} not after block start", addr);
        assert!(self.contains(addr), "split point {} outside block", addr);
        assert!(addr.is_aligned(PAGE_SIZE), "split point {} not page aligned", addr);

        let head_pages = (addr - self.address) / PAGE_SIZE;
        let head = MemoryBlock {
            address: self.address,
            num_pages: head_pages,
            ..self.clone()
        };

        self.address = addr;
        self.num_pages -= head_pages;
        head
    }

    /// Grow the block by `num_pages`
    pub fn add_pages(&mut self, num_pages: u64) {
        assert!(num_pages > 0, "adding zero pages");
        self.num_pages += num_pages;
    }

    /// Reclassify the block, carrying its transient attribute bits
    pub fn update(
        &mut self,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) {
        assert_eq!(
            self.original_permission,
            MemoryPermission::NONE,
            "reclassifying an IPC-locked block"
        );
        assert!(
            !self.attribute.contains(MemoryAttribute::IPC_LOCKED),
            "reclassifying an IPC-locked block"
        );

        self.state = state;
        self.permission = permission;
        self.attribute = attribute | (self.attribute & ATTRIBUTE_CARRY_MASK);
    }

    /// Take one device-share reference
    pub fn share_to_device(&mut self) -> MemResult<()> {
        assert!(
            self.attribute.contains(MemoryAttribute::DEVICE_SHARED) || self.device_use_count == 0,
            "device count set without the device-shared bit"
        );

        self.device_use_count = self
            .device_use_count
            .checked_add(1)
            .ok_or(MemError::LimitReached)?;
        self.attribute |= MemoryAttribute::DEVICE_SHARED;
        Ok(())
    }

    /// Drop one device-share reference
    pub fn unshare_to_device(&mut self) -> MemResult<()> {
        if !self.attribute.contains(MemoryAttribute::DEVICE_SHARED) {
            return Err(MemError::InvalidCurrentMemory);
        }
        assert!(self.device_use_count > 0, "device-shared bit without a count");

        self.device_use_count -= 1;
        if self.device_use_count == 0 {
            self.attribute.remove(MemoryAttribute::DEVICE_SHARED);
        }
        Ok(())
    }

    /// Take one IPC lock, swapping in `new_permission` on the first one
    pub fn lock_for_ipc(&mut self, new_permission: MemoryPermission) -> MemResult<()> {
        assert!(
            self.attribute.contains(MemoryAttribute::IPC_LOCKED) || self.ipc_lock_count == 0,
            "IPC count set without the IPC-locked bit"
        );

        self.ipc_lock_count = self
            .ipc_lock_count
            .checked_add(1)
            .ok_or(MemError::LimitReached)?;

        if self.ipc_lock_count == 1 {
            assert_eq!(self.original_permission, MemoryPermission::NONE);
            self.original_permission = self.permission;
            self.permission = (new_permission & MemoryPermission::IPC_LOCK_CHANGE_MASK)
                | (self.original_permission - MemoryPermission::IPC_LOCK_CHANGE_MASK);
        }
        self.attribute |= MemoryAttribute::IPC_LOCKED;
        Ok(())
    }

    /// Drop one IPC lock, restoring the saved permission on the last one
    pub fn unlock_for_ipc(&mut self) -> MemResult<()> {
        if !self.attribute.contains(MemoryAttribute::IPC_LOCKED) {
            return Err(MemError::InvalidCurrentMemory);
        }
        assert!(self.ipc_lock_count > 0, "IPC-locked bit without a count");

        self.ipc_lock_count -= 1;
        if self.ipc_lock_count == 0 {
            assert_ne!(self.original_permission, MemoryPermission::NONE);
            self.permission = self.original_permission;
            self.original_permission = MemoryPermission::NONE;
            self.attribute.remove(MemoryAttribute::IPC_LOCKED);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_block() -> MemoryBlock {
        MemoryBlock::new(
            VirtAddr::new(0x10000),
            16,
            MemoryState::NORMAL,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE,
        )
    }

    #[test]
    fn test_split_preserves_fields() {
        let mut tail = normal_block();
        let original = tail.clone();
        let head = tail.split(VirtAddr::new(0x14000));

        assert_eq!(head.address(), VirtAddr::new(0x10000));
        assert_eq!(head.num_pages(), 4);
        assert_eq!(tail.address(), VirtAddr::new(0x14000));
        assert_eq!(tail.num_pages(), 12);
        assert_eq!(head.end_address(), tail.address());
        assert_eq!(tail.end_address(), original.end_address());
        assert!(head.has_same_properties(&original));
        assert!(tail.has_same_properties(&original));
    }

    #[test]
    #[should_panic]
    fn test_split_at_start_panics() {
        let mut block = normal_block();
        block.split(VirtAddr::new(0x10000));
    }

    #[test]
    #[should_panic]
    fn test_split_unaligned_panics() {
        let mut block = normal_block();
        block.split(VirtAddr::new(0x10800));
    }

    #[test]
    fn test_update_carries_transient_bits() {
        let mut block = normal_block();
        block.share_to_device().unwrap();
        block.update(MemoryState::NORMAL, MemoryPermission::USER_READ, MemoryAttribute::UNCACHED);

        assert_eq!(block.permission(), MemoryPermission::USER_READ);
        assert_eq!(
            block.attribute(),
            MemoryAttribute::UNCACHED | MemoryAttribute::DEVICE_SHARED
        );
        assert!(block.is_update_noop(
            MemoryState::NORMAL,
            MemoryPermission::USER_READ,
            MemoryAttribute::UNCACHED
        ));
    }

    #[test]
    fn test_device_share_counting() {
        let mut block = normal_block();
        for _ in 0..3 {
            block.share_to_device().unwrap();
        }
        block.unshare_to_device().unwrap();
        block.unshare_to_device().unwrap();

        assert_eq!(block.device_use_count(), 1);
        assert!(block.attribute().contains(MemoryAttribute::DEVICE_SHARED));

        block.unshare_to_device().unwrap();
        assert_eq!(block.device_use_count(), 0);
        assert!(!block.attribute().contains(MemoryAttribute::DEVICE_SHARED));
        assert_eq!(block.unshare_to_device(), Err(MemError::InvalidCurrentMemory));
    }

    #[test]
    fn test_device_share_overflow() {
        let mut block = normal_block();
        for _ in 0..u16::MAX {
            block.share_to_device().unwrap();
        }
        assert_eq!(block.share_to_device(), Err(MemError::LimitReached));
        assert_eq!(block.device_use_count(), u16::MAX);
    }

    #[test]
    fn test_ipc_lock_roundtrip() {
        let mut block = normal_block();
        block.lock_for_ipc(MemoryPermission::USER_READ).unwrap();
        block.lock_for_ipc(MemoryPermission::USER_READ).unwrap();

        assert_eq!(block.permission(), MemoryPermission::USER_READ);
        assert_eq!(block.original_permission(), MemoryPermission::USER_READ_WRITE);
        assert!(block.has_properties(
            MemoryState::NORMAL,
            MemoryPermission::USER_READ,
            MemoryAttribute::NONE
        ));

        block.unlock_for_ipc().unwrap();
        assert_eq!(block.ipc_lock_count(), 1);
        block.unlock_for_ipc().unwrap();
        assert_eq!(block.permission(), MemoryPermission::USER_READ_WRITE);
        assert_eq!(block.original_permission(), MemoryPermission::NONE);
        assert_eq!(block.attribute(), MemoryAttribute::NONE);
    }

    #[test]
    #[should_panic]
    fn test_update_while_ipc_locked_panics() {
        let mut block = normal_block();
        block.lock_for_ipc(MemoryPermission::USER_READ).unwrap();
        block.update(MemoryState::FREE, MemoryPermission::NONE, MemoryAttribute::NONE);
    }

    #[test]
    fn test_same_properties_compares_counts() {
        let plain = normal_block();
        let mut shared = normal_block();
        shared.share_to_device().unwrap();
        assert!(!plain.has_same_properties(&shared));
        assert!(shared.has_properties(
            MemoryState::NORMAL,
            MemoryPermission::USER_READ_WRITE,
            MemoryAttribute::NONE
        ));
    }
}
