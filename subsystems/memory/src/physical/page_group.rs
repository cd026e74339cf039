//! # Page Groups
//!
//! An ordered list of physical runs backing one mapping.

use crate::bytes_of;
use alloc::vec::Vec;
use tessera_hal::PhysAddr;

/// A contiguous run of physical pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun {
    /// First physical address
    pub address: PhysAddr,
    /// Number of pages
    pub num_pages: u64,
}

impl PageRun {
    /// Size of the run in bytes
    pub const fn size(&self) -> u64 {
        bytes_of(self.num_pages)
    }

    /// End address (exclusive)
    pub fn end(&self) -> PhysAddr {
        self.address + self.size()
    }
}

/// Ordered list of physical runs
///
/// Adjacent runs are always coalesced on insertion, so two groups covering
/// the same pages in the same order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageGroup {
    runs: Vec<PageRun>,
}

impl PageGroup {
    /// Create an empty group
    pub const fn new() -> Self {
        Self { runs: Vec::new() }
    }

    /// Append `num_pages` pages starting at `address`
    pub fn add_block(&mut self, address: PhysAddr, num_pages: u64) {
        if num_pages == 0 {
            return;
        }

        if let Some(last) = self.runs.last_mut() {
            if last.end() == address {
                last.num_pages += num_pages;
                return;
            }
        }

        self.runs.push(PageRun { address, num_pages });
    }

    /// Total number of pages
    pub fn num_pages(&self) -> u64 {
        self.runs.iter().map(|run| run.num_pages).sum()
    }

    /// Whether the group has no pages
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Whether the group is a single physically contiguous run
    pub fn is_contiguous(&self) -> bool {
        self.runs.len() == 1
    }

    /// Iterate over the runs in order
    pub fn iter(&self) -> impl Iterator<Item = &PageRun> + '_ {
        self.runs.iter()
    }

    /// Iterate over every page address in order
    pub fn pages(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.runs
            .iter()
            .flat_map(|run| (0..run.num_pages).map(move |i| run.address + bytes_of(i)))
    }
}

impl<'a> IntoIterator for &'a PageGroup {
    type Item = &'a PageRun;
    type IntoIter = core::slice::Iter<'a, PageRun>;

    fn into_iter(self) -> Self::IntoIter {
        self.runs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_adjacent_runs_coalesce() {
        let mut group = PageGroup::new();
        group.add_block(PhysAddr::new(0x1000), 2);
        group.add_block(PhysAddr::new(0x3000), 1);
        group.add_block(PhysAddr::new(0x8000), 1);

        assert_eq!(group.iter().count(), 2);
        assert_eq!(group.num_pages(), 4);
        assert!(!group.is_contiguous());
    }

    #[test]
    fn test_equivalence() {
        let mut a = PageGroup::new();
        a.add_block(PhysAddr::new(0x1000), 1);
        a.add_block(PhysAddr::new(0x2000), 1);

        let mut b = PageGroup::new();
        b.add_block(PhysAddr::new(0x1000), 2);
        assert_eq!(a, b);
        assert!(b.is_contiguous());
    }

    #[test]
    fn test_pages() {
        let mut group = PageGroup::new();
        group.add_block(PhysAddr::new(0x1000), 2);
        group.add_block(PhysAddr::new(0x9000), 1);
        group.add_block(PhysAddr::new(0x9000), 0);

        let pages: alloc::vec::Vec<_> = group.pages().collect();
        assert_eq!(
            pages,
            vec![PhysAddr::new(0x1000), PhysAddr::new(0x2000), PhysAddr::new(0x9000)]
        );
    }
}
