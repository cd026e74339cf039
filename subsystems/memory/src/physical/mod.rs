//! # Physical Memory Management
//!
//! Interface to the physical page allocator, plus a bitmap implementation.
//!
//! Every live mapping of a physical page owns exactly one reference on it.
//! Freshly allocated groups are returned holding one reference for the
//! caller, which the first mapping takes over.

pub mod bitmap;
pub mod page_group;

pub use bitmap::BitmapPageHeap;
pub use page_group::{PageGroup, PageRun};

use crate::MemResult;

/// Physical memory pool a process allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// Application pool
    Application,
    /// Applet pool
    Applet,
    /// System pool
    System,
    /// Non-secure system pool
    SystemNonSecure,
}

impl MemoryPool {
    /// Number of pools
    pub const COUNT: usize = 4;

    /// Index of the pool
    pub const fn index(self) -> usize {
        match self {
            Self::Application => 0,
            Self::Applet => 1,
            Self::System => 2,
            Self::SystemNonSecure => 3,
        }
    }
}

/// Which end of a pool allocations are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationDirection {
    /// Lowest addresses first
    #[default]
    FromFront,
    /// Highest addresses first
    FromBack,
}

/// Physical page allocator trait
///
/// Implementations provide actual allocation algorithms.
pub trait PhysicalAllocator: Send + Sync {
    /// Allocate `num_pages` pages, each holding one reference
    fn allocate_and_open(
        &self,
        num_pages: u64,
        pool: MemoryPool,
        direction: AllocationDirection,
    ) -> MemResult<PageGroup>;

    /// Take one more reference on every page of the group
    fn open(&self, group: &PageGroup);

    /// Drop one reference on every page; pages reaching zero are freed
    fn close(&self, group: &PageGroup);

    /// Free pages left in a pool
    fn free_pages(&self, pool: MemoryPool) -> u64;
}
