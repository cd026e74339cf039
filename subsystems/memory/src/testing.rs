//! Shared page-table fixture for unit tests

use crate::page_table::{Collaborators, PageTable, ProcessMemoryConfig};
use crate::physical::{BitmapPageHeap, MemoryPool};
use crate::random::{FixedRandom, RandomSource};
use crate::resource_limit::{CountingResourceLimit, LimitableResource};
use crate::region::MIB;
use alloc::sync::Arc;
use tessera_hal::mmu::SoftwareMmu;
use tessera_hal::{PhysAddr, VirtAddr};

pub(crate) const CODE_ADDR: VirtAddr = VirtAddr::new(0x800_0000);
pub(crate) const CODE_SIZE: u64 = 2 * MIB;
pub(crate) const POOL_BASE: PhysAddr = PhysAddr::new(0x8000_0000);
pub(crate) const POOL_PAGES: u64 = 4096;
pub(crate) const MEMORY_LIMIT: u64 = 8 * MIB;

pub(crate) struct Fixture {
    pub mmu: Arc<SoftwareMmu>,
    pub heap: Arc<BitmapPageHeap>,
    pub limit: Arc<CountingResourceLimit>,
    pub table: PageTable,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(ProcessMemoryConfig::new(CODE_ADDR, CODE_SIZE))
}

pub(crate) fn fixture_with(config: ProcessMemoryConfig) -> Fixture {
    fixture_with_random(config, Arc::new(FixedRandom(0)))
}

pub(crate) fn fixture_with_random(config: ProcessMemoryConfig, random: Arc<dyn RandomSource>) -> Fixture {
    let mmu = Arc::new(SoftwareMmu::new());
    let heap = Arc::new(BitmapPageHeap::new().with_pool(MemoryPool::Application, POOL_BASE, POOL_PAGES));
    let limit = Arc::new(CountingResourceLimit::new().with_limit(LimitableResource::PhysicalMemory, MEMORY_LIMIT));

    let collaborators = Collaborators {
        backing: mmu.clone(),
        allocator: heap.clone(),
        resource_limit: limit.clone(),
        random,
    };
    let table = PageTable::new(config, collaborators).unwrap();

    Fixture { mmu, heap, limit, table }
}

/// A second address space drawing on the fixture's page heap and quota
pub(crate) fn sibling_table(fx: &Fixture) -> (Arc<SoftwareMmu>, PageTable) {
    let mmu = Arc::new(SoftwareMmu::new());
    let collaborators = Collaborators {
        backing: mmu.clone(),
        allocator: fx.heap.clone(),
        resource_limit: fx.limit.clone(),
        random: Arc::new(FixedRandom(0)),
    };
    let table = PageTable::new(ProcessMemoryConfig::new(CODE_ADDR, CODE_SIZE), collaborators).unwrap();
    (mmu, table)
}
