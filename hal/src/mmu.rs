//! # MMU Abstraction
//!
//! This module defines the host translation backend consumed by the guest
//! page-table controller, plus a software implementation of it.
//!
//! The controller owns all classification state. A backend only records
//! `virtual page -> (physical page, protection)` and gives byte access to
//! the physical pages.

use crate::{HalError, HalResult, PhysAddr, VirtAddr, PAGE_BITS, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, RwLock};

bitflags! {
    /// Host-side protection applied to a mapped range
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostProtection: u8 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
        /// Read + Write
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Execute
        const RX = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

/// Host translation backend
///
/// Every call is made with the owning page table's lock held, so a backend
/// never sees two overlapping requests for the same table at once.
pub trait MemoryBacking: Send + Sync {
    /// Map `size` bytes at `virt` to the physical range starting at `phys`
    fn map_region(
        &self,
        virt: VirtAddr,
        size: u64,
        phys: PhysAddr,
        prot: HostProtection,
    ) -> HalResult<()>;

    /// Remove every translation in the range
    fn unmap_region(&self, virt: VirtAddr, size: u64) -> HalResult<()>;

    /// Change the protection of an already-mapped range
    fn protect_region(&self, virt: VirtAddr, size: u64, prot: HostProtection) -> HalResult<()>;

    /// Translate a virtual address to physical
    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr>;

    /// Copy guest bytes starting at `virt` into `buf`
    fn read_block(&self, virt: VirtAddr, buf: &mut [u8]) -> HalResult<()>;

    /// Copy `data` into guest memory starting at `virt`
    fn write_block(&self, virt: VirtAddr, data: &[u8]) -> HalResult<()>;

    /// Fill a mapped range with zeroes
    fn zero_fill(&self, virt: VirtAddr, size: u64) -> HalResult<()>;

    /// Flag a range as watched by the debugger
    fn mark_region_debug(&self, virt: VirtAddr, size: u64, debug: bool);

    /// Drop any cached instructions for the range
    fn invalidate_instruction_cache(&self, virt: VirtAddr, size: u64);
}

/// Translation entry for one virtual page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    /// Backing physical page
    pub phys: PhysAddr,
    /// Host protection
    pub prot: HostProtection,
    /// Debugger watch flag
    pub debug: bool,
}

/// Counters for backend activity
#[derive(Debug, Default)]
pub struct MmuStats {
    maps: AtomicU64,
    unmaps: AtomicU64,
    protects: AtomicU64,
    icache_invalidations: AtomicU64,
}

impl MmuStats {
    /// Number of `map_region` calls
    pub fn maps(&self) -> u64 {
        self.maps.load(Ordering::Relaxed)
    }

    /// Number of `unmap_region` calls
    pub fn unmaps(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }

    /// Number of `protect_region` calls
    pub fn protects(&self) -> u64 {
        self.protects.load(Ordering::Relaxed)
    }

    /// Number of instruction cache invalidations
    pub fn icache_invalidations(&self) -> u64 {
        self.icache_invalidations.load(Ordering::Relaxed)
    }

    /// Sum of all translation-changing calls
    pub fn total_operations(&self) -> u64 {
        self.maps() + self.unmaps() + self.protects()
    }
}

/// Pure-software translation backend
///
/// Physical page contents live in a sparse store keyed by frame number and
/// are materialized on first write, so two virtual aliases of one physical
/// page observe the same bytes.
#[derive(Debug, Default)]
pub struct SoftwareMmu {
    /// Translation entries keyed by virtual page number
    entries: RwLock<BTreeMap<u64, PageEntry>>,
    /// Physical page contents keyed by frame number
    frames: Mutex<BTreeMap<u64, Box<[u8]>>>,
    /// Pages left before an injected map failure
    fail_after_pages: Mutex<Option<u64>>,
    /// Unmap calls left before an injected unmap failure
    fail_after_unmaps: Mutex<Option<u64>>,
    /// Activity counters
    stats: MmuStats,
}

impl SoftwareMmu {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Get activity counters
    pub fn stats(&self) -> &MmuStats {
        &self.stats
    }

    /// Number of mapped virtual pages
    pub fn mapped_pages(&self) -> usize {
        self.entries.read().len()
    }

    /// Look up the entry for the page containing `virt`
    pub fn entry(&self, virt: VirtAddr) -> Option<PageEntry> {
        self.entries.read().get(&virt.page_number()).copied()
    }

    /// Make the map call that would cover page number `pages` fail
    ///
    /// Pages before that point are mapped normally, which lets callers
    /// exercise partial-failure rollback.
    pub fn inject_map_failure(&self, pages: u64) {
        *self.fail_after_pages.lock() = Some(pages);
    }

    /// Make the unmap call after `calls` successful ones fail
    pub fn inject_unmap_failure(&self, calls: u64) {
        *self.fail_after_unmaps.lock() = Some(calls);
    }

    fn unmap_should_fail(&self) -> bool {
        let mut fail = self.fail_after_unmaps.lock();
        match *fail {
            Some(0) => {
                *fail = None;
                true
            }
            Some(left) => {
                *fail = Some(left - 1);
                false
            }
            None => false,
        }
    }

    fn pages_before_failure(&self, num_pages: u64) -> u64 {
        let mut fail = self.fail_after_pages.lock();
        match *fail {
            Some(left) if left < num_pages => {
                *fail = None;
                left
            }
            Some(left) => {
                *fail = Some(left - num_pages);
                num_pages
            }
            None => num_pages,
        }
    }

    fn frame_op<F>(&self, virt: VirtAddr, len: usize, mut op: F) -> HalResult<()>
    where
        F: FnMut(&mut BTreeMap<u64, Box<[u8]>>, u64, usize, usize, usize),
    {
        let entries = self.entries.read();
        let mut frames = self.frames.lock();
        let mut done = 0usize;
        let mut cursor = virt;

        while done < len {
            let entry = entries
                .get(&cursor.page_number())
                .ok_or(HalError::NotMapped)?;
            let offset = cursor.page_offset() as usize;
            let chunk = core::cmp::min(PAGE_SIZE as usize - offset, len - done);
            op(&mut *frames, entry.phys.frame_number(), offset, done, chunk);
            done += chunk;
            cursor += chunk as u64;
        }

        Ok(())
    }
}

impl MemoryBacking for SoftwareMmu {
    fn map_region(
        &self,
        virt: VirtAddr,
        size: u64,
        phys: PhysAddr,
        prot: HostProtection,
    ) -> HalResult<()> {
        if !virt.is_page_aligned() || !phys.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(HalError::InvalidAddress);
        }

        let num_pages = size >> PAGE_BITS;
        let mut entries = self.entries.write();
        let first = virt.page_number();
        if entries.range(first..first + num_pages).next().is_some() {
            return Err(HalError::AlreadyMapped);
        }

        let allowed = self.pages_before_failure(num_pages);
        for i in 0..allowed {
            let entry = PageEntry {
                phys: phys + (i << PAGE_BITS),
                prot,
                debug: false,
            };
            entries.insert(first + i, entry);
        }
        self.stats.maps.fetch_add(1, Ordering::Relaxed);

        if allowed < num_pages {
            log::trace!("soft mmu: injected failure at {}", virt + (allowed << PAGE_BITS));
            return Err(HalError::OutOfMemory);
        }

        log::trace!("soft mmu: map {} -> {} ({} pages, {:?})", virt, phys, num_pages, prot);
        Ok(())
    }

    fn unmap_region(&self, virt: VirtAddr, size: u64) -> HalResult<()> {
        if !virt.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(HalError::InvalidAddress);
        }

        if self.unmap_should_fail() {
            log::trace!("soft mmu: injected unmap failure at {}", virt);
            return Err(HalError::InvalidParameter);
        }

        let first = virt.page_number();
        let mut entries = self.entries.write();
        for page in first..first + (size >> PAGE_BITS) {
            entries.remove(&page);
        }
        self.stats.unmaps.fetch_add(1, Ordering::Relaxed);

        log::trace!("soft mmu: unmap {} ({} bytes)", virt, size);
        Ok(())
    }

    fn protect_region(&self, virt: VirtAddr, size: u64, prot: HostProtection) -> HalResult<()> {
        let first = virt.page_number();
        let mut entries = self.entries.write();
        for (_, entry) in entries.range_mut(first..first + (size >> PAGE_BITS)) {
            entry.prot = prot;
        }
        self.stats.protects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.entries
            .read()
            .get(&virt.page_number())
            .map(|entry| entry.phys + virt.page_offset())
    }

    fn read_block(&self, virt: VirtAddr, buf: &mut [u8]) -> HalResult<()> {
        let len = buf.len();
        self.frame_op(virt, len, |frames, frame, offset, done, chunk| {
            let dst = &mut buf[done..done + chunk];
            match frames.get(&frame) {
                Some(data) => dst.copy_from_slice(&data[offset..offset + chunk]),
                None => dst.fill(0),
            }
        })
    }

    fn write_block(&self, virt: VirtAddr, data: &[u8]) -> HalResult<()> {
        self.frame_op(virt, data.len(), |frames, frame, offset, done, chunk| {
            let page = frames
                .entry(frame)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
        })
    }

    fn zero_fill(&self, virt: VirtAddr, size: u64) -> HalResult<()> {
        self.frame_op(virt, size as usize, |frames, frame, offset, _, chunk| {
            if chunk == PAGE_SIZE as usize {
                frames.remove(&frame);
            } else if let Some(page) = frames.get_mut(&frame) {
                page[offset..offset + chunk].fill(0);
            }
        })
    }

    fn mark_region_debug(&self, virt: VirtAddr, size: u64, debug: bool) {
        let first = virt.page_number();
        let mut entries = self.entries.write();
        for (_, entry) in entries.range_mut(first..first + (size >> PAGE_BITS)) {
            entry.debug = debug;
        }
    }

    fn invalidate_instruction_cache(&self, virt: VirtAddr, size: u64) {
        self.stats.icache_invalidations.fetch_add(1, Ordering::Relaxed);
        log::trace!("soft mmu: icache invalidate {} ({} bytes)", virt, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_translate_unmap() {
        let mmu = SoftwareMmu::new();
        mmu.map_region(VirtAddr::new(0x10000), 0x2000, PhysAddr::new(0x80000), HostProtection::RW)
            .unwrap();

        assert_eq!(mmu.mapped_pages(), 2);
        assert_eq!(mmu.translate(VirtAddr::new(0x11010)), Some(PhysAddr::new(0x81010)));
        assert_eq!(
            mmu.map_region(VirtAddr::new(0x11000), 0x1000, PhysAddr::new(0x0), HostProtection::RW),
            Err(HalError::AlreadyMapped)
        );

        mmu.unmap_region(VirtAddr::new(0x10000), 0x2000).unwrap();
        assert_eq!(mmu.translate(VirtAddr::new(0x10000)), None);
        assert_eq!(mmu.stats().maps(), 1);
        assert_eq!(mmu.stats().unmaps(), 1);
    }

    #[test]
    fn test_aliases_share_bytes() {
        let mmu = SoftwareMmu::new();
        let phys = PhysAddr::new(0x40000);
        mmu.map_region(VirtAddr::new(0x1000), 0x1000, phys, HostProtection::RW).unwrap();
        mmu.map_region(VirtAddr::new(0x9000), 0x1000, phys, HostProtection::READ).unwrap();

        mmu.write_block(VirtAddr::new(0x1ffe), &[0xAB, 0xCD]).unwrap();
        let mut buf = [0u8; 2];
        mmu.read_block(VirtAddr::new(0x9ffe), &mut buf).unwrap();
        assert_eq!(buf, [0xAB, 0xCD]);

        mmu.zero_fill(VirtAddr::new(0x1000), 0x1000).unwrap();
        mmu.read_block(VirtAddr::new(0x9ffe), &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn test_access_unmapped_fails() {
        let mmu = SoftwareMmu::new();
        let mut buf = [0u8; 4];
        assert_eq!(mmu.read_block(VirtAddr::new(0x5000), &mut buf), Err(HalError::NotMapped));
    }

    #[test]
    fn test_injected_failure_maps_prefix() {
        let mmu = SoftwareMmu::new();
        mmu.inject_map_failure(3);

        let result = mmu.map_region(
            VirtAddr::new(0x100000),
            0x5000,
            PhysAddr::new(0x200000),
            HostProtection::RW,
        );
        assert_eq!(result, Err(HalError::OutOfMemory));
        assert_eq!(mmu.mapped_pages(), 3);

        // The injection is one-shot
        mmu.map_region(VirtAddr::new(0x400000), 0x1000, PhysAddr::new(0x0), HostProtection::RW)
            .unwrap();
    }

    #[test]
    fn test_injected_unmap_failure_keeps_entries() {
        let mmu = SoftwareMmu::new();
        mmu.map_region(VirtAddr::new(0x1000), 0x2000, PhysAddr::new(0x8000), HostProtection::RW)
            .unwrap();
        mmu.inject_unmap_failure(1);

        mmu.unmap_region(VirtAddr::new(0x1000), 0x1000).unwrap();
        assert_eq!(
            mmu.unmap_region(VirtAddr::new(0x2000), 0x1000),
            Err(HalError::InvalidParameter)
        );
        assert_eq!(mmu.translate(VirtAddr::new(0x2000)), Some(PhysAddr::new(0x9000)));

        mmu.unmap_region(VirtAddr::new(0x2000), 0x1000).unwrap();
        assert_eq!(mmu.mapped_pages(), 0);
    }

    #[test]
    fn test_protect_and_debug() {
        let mmu = SoftwareMmu::new();
        let virt = VirtAddr::new(0x3000);
        mmu.map_region(virt, 0x1000, PhysAddr::new(0x3000), HostProtection::RX).unwrap();
        mmu.protect_region(virt, 0x1000, HostProtection::READ).unwrap();
        mmu.mark_region_debug(virt, 0x1000, true);

        let entry = mmu.entry(virt).unwrap();
        assert_eq!(entry.prot, HostProtection::READ);
        assert!(entry.debug);
    }
}
