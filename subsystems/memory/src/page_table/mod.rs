//! # Page Table
//!
//! The controller that owns a process address space. Every public
//! operation validates the block tree against a state filter, reserves the
//! tree nodes it will need, drives the host backend and only then rewrites
//! the tree, so a failure at any step leaves both sides as they were.
//!
//! ## Locking
//!
//! One general lock guards the block tree, the heap end and the usage
//! counters. Physical-memory mapping and heap resizing additionally
//! serialize on a second lock because they drop the general lock to
//! allocate pages. That lock is always taken first.

mod alias;
mod code;
mod heap;
mod ipc;
mod lock;
mod mapping;
mod physical;
mod process;

use crate::physical::{AllocationDirection, MemoryPool, PageGroup, PhysicalAllocator};
use crate::random::RandomSource;
use crate::region::{AddressSpaceType, Region, RegionLayout};
use crate::resource_limit::ResourceLimit;
use crate::virtual_memory::{MemoryBlockManager, MemoryInfo};
use crate::{bytes_of, MemError, MemResult, MemoryAttribute, MemoryPermission, MemoryState};
use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;
use tessera_hal::mmu::MemoryBacking;
use tessera_hal::{PhysAddr, VirtAddr, PAGE_SIZE};

/// Services the page table depends on
#[derive(Clone)]
pub struct Collaborators {
    /// Host translation backend
    pub backing: Arc<dyn MemoryBacking>,
    /// Physical page source
    pub allocator: Arc<dyn PhysicalAllocator>,
    /// Quota accounting for the owning process
    pub resource_limit: Arc<dyn ResourceLimit>,
    /// Randomness for region and mapping placement
    pub random: Arc<dyn RandomSource>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Creation parameters for a process address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemoryConfig {
    /// Address space width selector
    pub address_space_type: AddressSpaceType,
    /// Randomize region and mapping placement
    pub enable_aslr: bool,
    /// Base of the code image
    pub code_address: VirtAddr,
    /// Size of the code image
    pub code_size: u64,
    /// Pool fresh pages are drawn from
    pub pool: MemoryPool,
    /// End of the pool allocation starts from
    pub direction: AllocationDirection,
    /// Kernel-owned table
    pub is_kernel: bool,
}

impl ProcessMemoryConfig {
    /// User process config with a 39-bit space and ASLR off
    pub fn new(code_address: VirtAddr, code_size: u64) -> Self {
        Self {
            address_space_type: AddressSpaceType::default(),
            enable_aslr: false,
            code_address,
            code_size,
            pool: MemoryPool::Application,
            direction: AllocationDirection::FromFront,
            is_kernel: false,
        }
    }

    /// Set the address space width
    pub fn with_address_space_type(mut self, address_space_type: AddressSpaceType) -> Self {
        self.address_space_type = address_space_type;
        self
    }

    /// Enable or disable ASLR
    pub fn with_aslr(mut self, enable: bool) -> Self {
        self.enable_aslr = enable;
        self
    }

    /// Draw pages from `pool`
    pub fn with_pool(mut self, pool: MemoryPool) -> Self {
        self.pool = pool;
        self
    }

    /// Allocate pages starting from `direction`
    pub fn with_direction(mut self, direction: AllocationDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Mark the table as kernel-owned
    pub fn kernel(mut self) -> Self {
        self.is_kernel = true;
        self
    }
}

/// State guarded by the general lock
#[derive(Debug)]
struct TableState {
    blocks: MemoryBlockManager,
    current_heap_end: VirtAddr,
    max_heap_size: u64,
    mapped_physical_memory_size: u64,
}

/// Backend request issued by an operation
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operation<'a> {
    /// Map a contiguous physical range
    Map(PhysAddr),
    /// Map every run of a page group back to back
    MapGroup(&'a PageGroup),
    Unmap,
    ChangePermissions,
    /// Change permissions and drop cached instructions
    ChangePermissionsAndRefresh,
}

/// Mask/expected pairs a range must satisfy
///
/// Each block must satisfy `value & mask == expected` for state,
/// permission and attribute. `ignore_attr` lists the attribute bits that
/// may differ between blocks of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFilter {
    /// State bits compared
    pub state_mask: MemoryState,
    /// Expected masked state
    pub state: MemoryState,
    /// Permission bits compared
    pub perm_mask: MemoryPermission,
    /// Expected masked permission
    pub perm: MemoryPermission,
    /// Attribute bits compared
    pub attr_mask: MemoryAttribute,
    /// Expected masked attribute
    pub attr: MemoryAttribute,
    /// Attribute bits allowed to vary across the range
    pub ignore_attr: MemoryAttribute,
}

impl StateFilter {
    /// Build a filter ignoring the transient IPC and device bits
    pub const fn new(
        state_mask: MemoryState,
        state: MemoryState,
        perm_mask: MemoryPermission,
        perm: MemoryPermission,
        attr_mask: MemoryAttribute,
        attr: MemoryAttribute,
    ) -> Self {
        Self {
            state_mask,
            state,
            perm_mask,
            perm,
            attr_mask,
            attr,
            ignore_attr: MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        }
    }

    /// Filter matching only unmapped free memory
    pub const fn free() -> Self {
        Self::new(
            MemoryState::ALL,
            MemoryState::FREE,
            MemoryPermission::ALL,
            MemoryPermission::NONE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
        )
    }

    /// Replace the set of attribute bits allowed to vary
    pub const fn ignoring(self, ignore_attr: MemoryAttribute) -> Self {
        Self { ignore_attr, ..self }
    }

    fn accepts(&self, state: MemoryState, perm: MemoryPermission, attr: MemoryAttribute) -> bool {
        state.matches(self.state_mask, self.state)
            && perm.matches(self.perm_mask, self.perm)
            && attr.matches(self.attr_mask, self.attr)
    }
}

/// Classification shared by every block of a checked range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckedState {
    /// Common state
    pub state: MemoryState,
    /// Common permission
    pub permission: MemoryPermission,
    /// Common attribute with the ignored bits cleared
    pub attribute: MemoryAttribute,
}

/// Check that `[addr, addr + size)` is uniformly classified and passes `filter`
pub(crate) fn check_memory_state(
    blocks: &MemoryBlockManager,
    addr: VirtAddr,
    size: u64,
    filter: &StateFilter,
) -> MemResult<CheckedState> {
    let end = addr.checked_add(size).ok_or(MemError::InvalidSize)?;
    let ignore = filter.ignore_attr;
    let mut first: Option<CheckedState> = None;

    for block in blocks.iter_range(addr, end) {
        let (state, permission, attribute) = (block.state(), block.permission(), block.attribute());
        match first {
            None => {
                first = Some(CheckedState { state, permission, attribute });
            }
            Some(head) => {
                if state != head.state
                    || permission != head.permission
                    || (attribute | ignore) != (head.attribute | ignore)
                {
                    return Err(MemError::InvalidCurrentMemory);
                }
            }
        }
        if !filter.accepts(state, permission, attribute) {
            return Err(MemError::InvalidCurrentMemory);
        }
    }

    let head = first.ok_or(MemError::InvalidCurrentMemory)?;
    Ok(CheckedState {
        attribute: head.attribute - ignore,
        ..head
    })
}

/// Bytes of `[start, end)` covered by the block `[block_start, block_end)`
fn overlap(block_start: VirtAddr, block_end: VirtAddr, start: VirtAddr, end: VirtAddr) -> u64 {
    block_end.min(end) - block_start.max(start)
}

macro_rules! region_accessors {
    ($($field:ident => $name:ident, $what:literal;)*) => {
        paste::paste! {
            $(
                #[doc = concat!("First address of the ", $what)]
                pub fn [<$name _start>](&self) -> VirtAddr {
                    self.layout.$field.start
                }

                #[doc = concat!("End address (exclusive) of the ", $what)]
                pub fn [<$name _end>](&self) -> VirtAddr {
                    self.layout.$field.end
                }

                #[doc = concat!("Size in bytes of the ", $what)]
                pub fn [<$name _size>](&self) -> u64 {
                    self.layout.$field.size()
                }
            )*
        }
    };
}

/// Guest address space controller
pub struct PageTable {
    layout: RegionLayout,
    pool: MemoryPool,
    direction: AllocationDirection,
    is_kernel: bool,
    aslr: bool,
    collaborators: Collaborators,
    general_lock: Mutex<TableState>,
    map_physical_memory_lock: Mutex<()>,
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("layout", &self.layout)
            .field("pool", &self.pool)
            .field("is_kernel", &self.is_kernel)
            .field("aslr", &self.aslr)
            .finish_non_exhaustive()
    }
}

impl PageTable {
    /// Lay out a fresh address space and start tracking it as one free block
    pub fn new(config: ProcessMemoryConfig, collaborators: Collaborators) -> MemResult<Self> {
        let layout = RegionLayout::compute(
            config.address_space_type,
            config.code_address,
            config.code_size,
            config.enable_aslr,
            &*collaborators.random,
        )?;
        let blocks = MemoryBlockManager::new(layout.address_space.start, layout.address_space.end)?;

        log::debug!(
            "page table: {}-bit space, heap {}, alias {}, stack {}",
            layout.width,
            layout.heap,
            layout.alias,
            layout.stack
        );

        Ok(Self {
            layout,
            pool: config.pool,
            direction: config.direction,
            is_kernel: config.is_kernel,
            aslr: config.enable_aslr,
            collaborators,
            general_lock: Mutex::new(TableState {
                blocks,
                current_heap_end: layout.heap.start,
                max_heap_size: 0,
                mapped_physical_memory_size: 0,
            }),
            map_physical_memory_lock: Mutex::new(()),
        })
    }

    /// Region placement of this address space
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Width of the address space in bits
    pub fn address_space_width(&self) -> u32 {
        self.layout.width
    }

    region_accessors! {
        address_space => address_space, "address space";
        heap => heap_region, "heap region";
        alias => alias_region, "alias region";
        stack => stack_region, "stack region";
        kernel_map => kernel_map_region, "kernel map region";
        code => code_region, "code region";
        alias_code => alias_code_region, "alias code region";
    }

    /// Bytes currently mapped in the heap
    pub fn current_heap_size(&self) -> u64 {
        let state = self.general_lock.lock();
        state.current_heap_end - self.layout.heap.start
    }

    /// Ceiling for [`set_heap_size`](Self::set_heap_size)
    pub fn max_heap_size(&self) -> u64 {
        self.general_lock.lock().max_heap_size
    }

    /// Bytes mapped through [`map_physical_memory`](Self::map_physical_memory)
    pub fn mapped_physical_memory_size(&self) -> u64 {
        self.general_lock.lock().mapped_physical_memory_size
    }

    /// Heap plus physically mapped memory
    pub fn total_heap_size(&self) -> u64 {
        let state = self.general_lock.lock();
        (state.current_heap_end - self.layout.heap.start) + state.mapped_physical_memory_size
    }

    /// Number of blocks currently tracked
    pub fn block_count(&self) -> usize {
        self.general_lock.lock().blocks.block_count()
    }

    /// Walk the block tree and verify its invariants
    pub fn check_consistency(&self) -> bool {
        self.general_lock.lock().blocks.check_consistency()
    }

    /// Describe the block containing `addr`
    ///
    /// Addresses past the end of the space report one inaccessible block
    /// running to the top of the 64-bit range.
    pub fn query_info(&self, addr: VirtAddr) -> MemoryInfo {
        let end = self.layout.address_space.end;
        let outside = MemoryInfo {
            address: end,
            size: 0u64.wrapping_sub(end.as_u64()),
            state: MemoryState::INACCESSIBLE,
            permission: MemoryPermission::NONE,
            attribute: MemoryAttribute::NONE,
            original_permission: MemoryPermission::NONE,
            ipc_lock_count: 0,
            device_use_count: 0,
        };
        if !self.layout.address_space.contains(addr) {
            return outside;
        }

        let state = self.general_lock.lock();
        match state.blocks.memory_info(addr) {
            Some(info) => info,
            None => panic!("block tree does not cover {}", addr),
        }
    }

    /// Run a state check against the current tree
    pub fn check_memory_state(&self, addr: VirtAddr, size: u64, filter: &StateFilter) -> MemResult<CheckedState> {
        self.validate_range(addr, size)?;
        let state = self.general_lock.lock();
        check_memory_state(&state.blocks, addr, size, filter)
    }

    /// Whether the whole range lies inside the address space
    pub fn is_inside_address_space(&self, addr: VirtAddr, size: u64) -> bool {
        self.layout.address_space.contains_range(addr, size)
    }

    /// Whether the range is not fully inside the alias region
    pub fn is_outside_alias_region(&self, addr: VirtAddr, size: u64) -> bool {
        !self.layout.alias.contains_range(addr, size)
    }

    /// Whether the range is not fully inside the stack region
    pub fn is_outside_stack_region(&self, addr: VirtAddr, size: u64) -> bool {
        !self.layout.stack.contains_range(addr, size)
    }

    /// Whether the range runs past the alias code region
    pub fn is_invalid_region(&self, addr: VirtAddr, size: u64) -> bool {
        match addr.checked_add(size) {
            Some(end) => end > self.layout.alias_code.end,
            None => true,
        }
    }

    /// Whether the range touches the heap region
    pub fn is_inside_heap_region(&self, addr: VirtAddr, size: u64) -> bool {
        self.layout.heap.overlaps_range(addr, size)
    }

    /// Whether the range touches the alias region
    pub fn is_inside_alias_region(&self, addr: VirtAddr, size: u64) -> bool {
        self.layout.alias.overlaps_range(addr, size)
    }

    /// Whether the range is valid for randomized general mappings
    pub fn is_inside_aslr_region(&self, addr: VirtAddr, size: u64) -> bool {
        !(self.is_invalid_region(addr, size)
            || self.is_inside_heap_region(addr, size)
            || self.is_inside_alias_region(addr, size))
    }

    /// Region memory of `state` is placed in
    pub fn region_for_state(&self, state: MemoryState) -> Option<Region> {
        const ALIAS_CODE_STATES: [MemoryState; 9] = [
            MemoryState::IO,
            MemoryState::SHARED,
            MemoryState::ALIAS_CODE,
            MemoryState::ALIAS_CODE_DATA,
            MemoryState::TRANSFERRED,
            MemoryState::SHARED_TRANSFERRED,
            MemoryState::SHARED_CODE,
            MemoryState::GENERATED_CODE,
            MemoryState::CODE_OUT,
        ];

        let layout = &self.layout;
        let region = if state == MemoryState::FREE || state == MemoryState::KERNEL {
            layout.address_space
        } else if state == MemoryState::NORMAL {
            layout.heap
        } else if state.is_ipc() {
            layout.alias
        } else if state == MemoryState::STACK {
            layout.stack
        } else if state == MemoryState::STATIC || state == MemoryState::THREAD_LOCAL {
            layout.kernel_map
        } else if state == MemoryState::CODE || state == MemoryState::CODE_DATA {
            layout.code
        } else if ALIAS_CODE_STATES.contains(&state) {
            layout.alias_code
        } else {
            return None;
        };
        Some(region)
    }

    /// Whether memory of `state` may occupy `[addr, addr + size)`
    pub fn can_contain(&self, addr: VirtAddr, size: u64, state: MemoryState) -> bool {
        let Some(region) = self.region_for_state(state) else {
            return false;
        };
        let in_region = region.contains_range(addr, size);
        let in_heap = self.layout.heap.overlaps_range(addr, size);
        let in_alias = self.layout.alias.overlaps_range(addr, size);

        if state == MemoryState::FREE || state == MemoryState::KERNEL {
            in_region
        } else if state == MemoryState::NORMAL {
            in_region && !in_alias
        } else if state.is_ipc() {
            in_region && !in_heap
        } else {
            in_region && !in_heap && !in_alias
        }
    }

    /// Copy guest memory out
    pub fn read_block(&self, addr: VirtAddr, buf: &mut [u8]) -> MemResult<()> {
        Ok(self.collaborators.backing.read_block(addr, buf)?)
    }

    /// Copy bytes into guest memory
    pub fn write_block(&self, addr: VirtAddr, data: &[u8]) -> MemResult<()> {
        Ok(self.collaborators.backing.write_block(addr, data)?)
    }

    /// Flag a debuggable range as watched by the debugger
    pub fn mark_region_debug(&self, addr: VirtAddr, size: u64, debug: bool) -> MemResult<()> {
        self.validate_range(addr, size)?;
        let state = self.general_lock.lock();
        check_memory_state(
            &state.blocks,
            addr,
            size,
            &StateFilter::new(
                MemoryState::FLAG_CAN_DEBUG,
                MemoryState::FLAG_CAN_DEBUG,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::NONE,
                MemoryAttribute::NONE,
            ),
        )?;
        self.collaborators.backing.mark_region_debug(addr, size, debug);
        Ok(())
    }

    /// Reject misaligned, empty and out-of-space ranges
    fn validate_range(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        if !addr.is_page_aligned() {
            return Err(MemError::InvalidAddress);
        }
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MemError::InvalidSize);
        }
        if !self.layout.address_space.contains_range(addr, size) {
            return Err(MemError::InvalidMemoryRegion);
        }
        Ok(())
    }

    /// Physical pages currently backing a mapped range
    fn page_group_of(&self, addr: VirtAddr, num_pages: u64) -> PageGroup {
        let mut group = PageGroup::new();
        for index in 0..num_pages {
            let page = addr + bytes_of(index);
            match self.collaborators.backing.translate(page) {
                Some(phys) => group.add_block(phys, 1),
                None => panic!("page {} tracked as mapped has no translation", page),
            }
        }
        group
    }

    /// Drive the host backend
    ///
    /// A failed map leaves nothing behind: whatever prefix the backend
    /// managed to install is torn down before the error is returned.
    pub(crate) fn operate(
        &self,
        addr: VirtAddr,
        num_pages: u64,
        perm: MemoryPermission,
        op: Operation<'_>,
    ) -> MemResult<()> {
        let backing = &*self.collaborators.backing;
        let size = bytes_of(num_pages);
        let prot = perm.host_protection();
        log::trace!("operate {:?}: {} ({} pages, {:?})", op, addr, num_pages, perm);

        match op {
            Operation::Map(phys) => {
                if let Err(err) = backing.map_region(addr, size, phys, prot) {
                    self.discard_partial_map(addr, size);
                    return Err(err.into());
                }
            }
            Operation::MapGroup(group) => {
                debug_assert_eq!(group.num_pages(), num_pages);
                let mut cursor = addr;
                for run in group.iter() {
                    if let Err(err) = backing.map_region(cursor, run.size(), run.address, prot) {
                        self.discard_partial_map(addr, (cursor - addr) + run.size());
                        return Err(err.into());
                    }
                    cursor += run.size();
                }
            }
            Operation::Unmap => backing.unmap_region(addr, size)?,
            Operation::ChangePermissions => backing.protect_region(addr, size, prot)?,
            Operation::ChangePermissionsAndRefresh => {
                backing.protect_region(addr, size, prot)?;
                backing.invalidate_instruction_cache(addr, size);
            }
        }
        Ok(())
    }

    fn discard_partial_map(&self, addr: VirtAddr, size: u64) {
        if let Err(err) = self.collaborators.backing.unmap_region(addr, size) {
            log::error!("page table: failed to discard partial map at {}: {}", addr, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Fixture, CODE_ADDR, CODE_SIZE};

    #[test]
    fn test_new_table_is_one_free_block() {
        let Fixture { table, .. } = fixture();
        assert_eq!(table.block_count(), 1);
        assert_eq!(table.address_space_width(), 39);
        assert_eq!(table.address_space_start(), VirtAddr::new(0));
        assert_eq!(table.address_space_end(), VirtAddr::new(1 << 39));
        assert!(table.code_region_start() <= CODE_ADDR);
        assert!(CODE_ADDR + CODE_SIZE <= table.code_region_end());
        assert_eq!(table.current_heap_size(), 0);

        let info = table.query_info(CODE_ADDR);
        assert_eq!(info.state, MemoryState::FREE);
        assert_eq!(info.size, 1 << 39);
    }

    #[test]
    fn test_query_info_outside_space() {
        let Fixture { table, .. } = fixture();
        let info = table.query_info(VirtAddr::new(1 << 40));
        assert_eq!(info.address, VirtAddr::new(1 << 39));
        assert_eq!(info.size, 0u64.wrapping_sub(1 << 39));
        assert_eq!(info.state, MemoryState::INACCESSIBLE);
        assert_eq!(info.permission, MemoryPermission::NONE);
    }

    #[test]
    fn test_region_predicates() {
        let Fixture { table, .. } = fixture();
        let heap = table.heap_region_start();
        let alias = table.alias_region_start();

        assert!(table.is_inside_heap_region(heap, PAGE_SIZE));
        assert!(!table.is_inside_heap_region(alias, PAGE_SIZE));
        assert!(table.is_inside_alias_region(alias, PAGE_SIZE));
        assert!(!table.is_outside_alias_region(alias, PAGE_SIZE));
        assert!(table.is_outside_alias_region(heap, PAGE_SIZE));
        assert!(!table.is_outside_stack_region(table.stack_region_start(), PAGE_SIZE));
        assert!(table.is_invalid_region(table.alias_code_region_end(), PAGE_SIZE));
        assert!(table.is_inside_aslr_region(CODE_ADDR, PAGE_SIZE));
        assert!(!table.is_inside_aslr_region(heap, PAGE_SIZE));
    }

    #[test]
    fn test_can_contain() {
        let Fixture { table, .. } = fixture();
        let heap = table.heap_region_start();
        let alias = table.alias_region_start();
        let stack = table.stack_region_start();

        assert!(table.can_contain(heap, PAGE_SIZE, MemoryState::NORMAL));
        assert!(!table.can_contain(alias, PAGE_SIZE, MemoryState::NORMAL));
        assert!(table.can_contain(alias, PAGE_SIZE, MemoryState::IPC));
        assert!(!table.can_contain(heap, PAGE_SIZE, MemoryState::IPC));
        assert!(table.can_contain(stack, PAGE_SIZE, MemoryState::STACK));
        assert!(!table.can_contain(heap, PAGE_SIZE, MemoryState::STACK));
        assert!(table.can_contain(CODE_ADDR, CODE_SIZE, MemoryState::CODE));
        assert!(!table.can_contain(CODE_ADDR, PAGE_SIZE, MemoryState::INACCESSIBLE));
        assert!(table.can_contain(alias, PAGE_SIZE, MemoryState::FREE));
    }

    #[test]
    fn test_validate_range() {
        let Fixture { table, .. } = fixture();
        assert_eq!(table.validate_range(CODE_ADDR + 1, PAGE_SIZE), Err(MemError::InvalidAddress));
        assert_eq!(table.validate_range(CODE_ADDR, 0), Err(MemError::InvalidSize));
        assert_eq!(table.validate_range(CODE_ADDR, PAGE_SIZE + 1), Err(MemError::InvalidSize));
        assert_eq!(
            table.validate_range(table.address_space_end() - PAGE_SIZE, 2 * PAGE_SIZE),
            Err(MemError::InvalidMemoryRegion)
        );
        assert_eq!(table.validate_range(CODE_ADDR, PAGE_SIZE), Ok(()));
    }

    #[test]
    fn test_check_memory_state_homogeneity() {
        let fx = fixture();
        let table = &fx.table;
        table
            .map_process_code(CODE_ADDR, 2, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE)
            .unwrap();
        table
            .map_process_code(
                CODE_ADDR + bytes_of(2),
                2,
                MemoryState::CODE_DATA,
                MemoryPermission::USER_READ_WRITE,
            )
            .unwrap();

        let any = StateFilter::new(
            MemoryState::empty(),
            MemoryState::empty(),
            MemoryPermission::NONE,
            MemoryPermission::NONE,
            MemoryAttribute::NONE,
            MemoryAttribute::NONE,
        );
        let checked = table.check_memory_state(CODE_ADDR, bytes_of(2), &any).unwrap();
        assert_eq!(checked.state, MemoryState::CODE);
        assert_eq!(checked.permission, MemoryPermission::USER_READ_EXECUTE);

        assert_eq!(
            table.check_memory_state(CODE_ADDR, bytes_of(4), &any),
            Err(MemError::InvalidCurrentMemory)
        );
        assert_eq!(
            table.check_memory_state(CODE_ADDR, bytes_of(2), &StateFilter::free()),
            Err(MemError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn test_operate_rolls_back_partial_map() {
        let fx = fixture();
        let group = fx
            .heap
            .allocate_and_open(4, MemoryPool::Application, AllocationDirection::FromFront)
            .unwrap();

        fx.mmu.inject_map_failure(2);
        let result = fx.table.operate(
            CODE_ADDR,
            group.num_pages(),
            MemoryPermission::USER_READ_WRITE,
            Operation::MapGroup(&group),
        );
        assert!(result.is_err());
        assert_eq!(fx.mmu.mapped_pages(), 0);
        fx.heap.close(&group);
    }

    #[test]
    fn test_mark_region_debug_requires_debuggable_state() {
        let fx = fixture();
        fx.table
            .map_process_code(CODE_ADDR, 1, MemoryState::CODE, MemoryPermission::USER_READ_EXECUTE)
            .unwrap();
        fx.table.mark_region_debug(CODE_ADDR, PAGE_SIZE, true).unwrap();
        assert!(fx.mmu.entry(CODE_ADDR).unwrap().debug);

        let heap = fx.table.heap_region_start();
        assert_eq!(
            fx.table.mark_region_debug(heap, PAGE_SIZE, true),
            Err(MemError::InvalidCurrentMemory)
        );
    }
}
