//! # Bitmap Page Heap
//!
//! A bitmap-based physical page allocator with per-page reference counts.
//! Each pool is one contiguous physical range.

use super::{AllocationDirection, MemoryPool, PageGroup, PhysicalAllocator};
use crate::{bytes_of, MemError, MemResult};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use tessera_hal::{PhysAddr, PAGE_BITS};

/// One pool's pages
#[derive(Debug)]
struct PoolHeap {
    /// Base address
    base: PhysAddr,
    /// Bitmap data (1 = used, 0 = free)
    bitmap: Vec<u64>,
    /// Reference count per page
    refcounts: Vec<u16>,
    /// Free page count
    free: u64,
}

impl PoolHeap {
    fn new(base: PhysAddr, num_pages: u64) -> Self {
        let words = (num_pages as usize).div_ceil(64);
        let mut bitmap = vec![0u64; words];

        // Bits past the end of the pool are permanently used
        let tail = num_pages as usize % 64;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }

        Self {
            base,
            bitmap,
            refcounts: vec![0; num_pages as usize],
            free: num_pages,
        }
    }

    fn total_pages(&self) -> usize {
        self.refcounts.len()
    }

    fn page_index(&self, addr: PhysAddr) -> usize {
        let index = ((addr - self.base) >> PAGE_BITS) as usize;
        assert!(index < self.total_pages(), "page {} outside pool", addr);
        index
    }

    fn page_address(&self, index: usize) -> PhysAddr {
        self.base + bytes_of(index as u64)
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr < self.page_address(self.total_pages())
    }

    fn set_used(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    fn set_free(&mut self, index: usize) {
        self.bitmap[index / 64] &= !(1 << (index % 64));
    }

    /// Collect `count` free page indices in allocation order
    fn find_free(&self, count: usize, direction: AllocationDirection) -> Vec<usize> {
        let mut found = Vec::with_capacity(count);
        let visit = |word_idx: usize, word: u64, found: &mut Vec<usize>| {
            let mut free_bits = !word;
            while free_bits != 0 && found.len() < count {
                let bit = match direction {
                    AllocationDirection::FromFront => free_bits.trailing_zeros(),
                    AllocationDirection::FromBack => 63 - free_bits.leading_zeros(),
                };
                found.push(word_idx * 64 + bit as usize);
                free_bits &= !(1u64 << bit);
            }
        };

        match direction {
            AllocationDirection::FromFront => {
                for (word_idx, &word) in self.bitmap.iter().enumerate() {
                    if found.len() == count {
                        break;
                    }
                    visit(word_idx, word, &mut found);
                }
            }
            AllocationDirection::FromBack => {
                for (word_idx, &word) in self.bitmap.iter().enumerate().rev() {
                    if found.len() == count {
                        break;
                    }
                    visit(word_idx, word, &mut found);
                }
            }
        }
        found
    }
}

/// Bitmap page heap
#[derive(Debug)]
pub struct BitmapPageHeap {
    /// Per-pool heaps
    pools: Mutex<[Option<PoolHeap>; MemoryPool::COUNT]>,
    /// Statistics
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl BitmapPageHeap {
    /// Create a heap with no pools
    pub const fn new() -> Self {
        Self {
            pools: Mutex::new([None, None, None, None]),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    /// Back `pool` with `num_pages` pages starting at `base`
    pub fn with_pool(self, pool: MemoryPool, base: PhysAddr, num_pages: u64) -> Self {
        self.add_pool(pool, base, num_pages);
        self
    }

    /// Back `pool` with `num_pages` pages starting at `base`
    pub fn add_pool(&self, pool: MemoryPool, base: PhysAddr, num_pages: u64) {
        assert!(base.is_page_aligned(), "pool base {} is not page aligned", base);
        self.pools.lock()[pool.index()] = Some(PoolHeap::new(base, num_pages));
        log::info!("page heap: {:?} pool at {} ({} pages)", pool, base, num_pages);
    }

    /// Pages allocated over the heap's lifetime
    pub fn allocated_pages(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Pages freed over the heap's lifetime
    pub fn freed_pages(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Current reference count of a page
    pub fn refcount(&self, addr: PhysAddr) -> u16 {
        let pools = self.pools.lock();
        pools
            .iter()
            .flatten()
            .find(|heap| heap.contains(addr))
            .map_or(0, |heap| heap.refcounts[heap.page_index(addr)])
    }

    fn for_each_page<F>(&self, group: &PageGroup, mut op: F)
    where
        F: FnMut(&mut PoolHeap, usize),
    {
        let mut pools = self.pools.lock();
        for page in group.pages() {
            let heap = pools
                .iter_mut()
                .flatten()
                .find(|heap| heap.contains(page));
            match heap {
                Some(heap) => {
                    let index = heap.page_index(page);
                    op(heap, index);
                }
                None => panic!("page {} does not belong to any pool", page),
            }
        }
    }
}

impl Default for BitmapPageHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalAllocator for BitmapPageHeap {
    fn allocate_and_open(
        &self,
        num_pages: u64,
        pool: MemoryPool,
        direction: AllocationDirection,
    ) -> MemResult<PageGroup> {
        let mut pools = self.pools.lock();
        let heap = pools[pool.index()].as_mut().ok_or(MemError::OutOfMemory)?;
        if heap.free < num_pages {
            return Err(MemError::OutOfMemory);
        }

        let mut indices = heap.find_free(num_pages as usize, direction);
        assert_eq!(indices.len(), num_pages as usize, "free count out of sync with bitmap");
        if direction == AllocationDirection::FromBack {
            indices.reverse();
        }

        let mut group = PageGroup::new();
        for index in indices {
            heap.set_used(index);
            heap.refcounts[index] = 1;
            group.add_block(heap.page_address(index), 1);
        }
        heap.free -= num_pages;
        self.allocations.fetch_add(num_pages, Ordering::Relaxed);

        Ok(group)
    }

    fn open(&self, group: &PageGroup) {
        self.for_each_page(group, |heap, index| {
            let count = &mut heap.refcounts[index];
            assert!(*count > 0, "opening free page");
            assert!(*count < u16::MAX, "page reference count overflow");
            *count += 1;
        });
    }

    fn close(&self, group: &PageGroup) {
        let mut freed = 0;
        self.for_each_page(group, |heap, index| {
            let count = &mut heap.refcounts[index];
            assert!(*count > 0, "closing free page");
            *count -= 1;
            if *count == 0 {
                heap.set_free(index);
                heap.free += 1;
                freed += 1;
            }
        });
        self.frees.fetch_add(freed, Ordering::Relaxed);
    }

    fn free_pages(&self, pool: MemoryPool) -> u64 {
        self.pools.lock()[pool.index()]
            .as_ref()
            .map_or(0, |heap| heap.free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> BitmapPageHeap {
        BitmapPageHeap::new().with_pool(MemoryPool::Application, PhysAddr::new(0x8000_0000), 100)
    }

    #[test]
    fn test_allocate_from_front() {
        let heap = heap();
        let group = heap
            .allocate_and_open(3, MemoryPool::Application, AllocationDirection::FromFront)
            .unwrap();

        assert!(group.is_contiguous());
        assert_eq!(group.iter().next().unwrap().address, PhysAddr::new(0x8000_0000));
        assert_eq!(heap.free_pages(MemoryPool::Application), 97);
        assert_eq!(heap.refcount(PhysAddr::new(0x8000_1000)), 1);
    }

    #[test]
    fn test_allocate_from_back() {
        let heap = heap();
        let group = heap
            .allocate_and_open(2, MemoryPool::Application, AllocationDirection::FromBack)
            .unwrap();

        let run = group.iter().next().unwrap();
        assert_eq!(run.address, PhysAddr::new(0x8000_0000 + 98 * 0x1000));
        assert_eq!(run.num_pages, 2);
    }

    #[test]
    fn test_refcounting_frees_at_zero() {
        let heap = heap();
        let group = heap
            .allocate_and_open(4, MemoryPool::Application, AllocationDirection::FromFront)
            .unwrap();

        heap.open(&group);
        heap.close(&group);
        assert_eq!(heap.free_pages(MemoryPool::Application), 96);

        heap.close(&group);
        assert_eq!(heap.free_pages(MemoryPool::Application), 100);
        assert_eq!(heap.freed_pages(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let heap = heap();
        assert_eq!(
            heap.allocate_and_open(101, MemoryPool::Application, AllocationDirection::FromFront),
            Err(MemError::OutOfMemory)
        );
        assert_eq!(
            heap.allocate_and_open(1, MemoryPool::System, AllocationDirection::FromFront),
            Err(MemError::OutOfMemory)
        );
    }

    #[test]
    fn test_fragmented_allocation() {
        let heap = heap();
        let first = heap
            .allocate_and_open(10, MemoryPool::Application, AllocationDirection::FromFront)
            .unwrap();
        let mut hole = PageGroup::new();
        hole.add_block(PhysAddr::new(0x8000_2000), 2);
        heap.close(&hole);

        let group = heap
            .allocate_and_open(4, MemoryPool::Application, AllocationDirection::FromFront)
            .unwrap();
        let runs: Vec<_> = group.iter().copied().collect();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].address, PhysAddr::new(0x8000_2000));
        assert_eq!(runs[1].address, PhysAddr::new(0x8000_a000));
        assert_eq!(first.num_pages(), 10);
    }
}
