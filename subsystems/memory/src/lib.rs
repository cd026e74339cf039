//! # Tessera Memory Subsystem
//!
//! Guest virtual-memory management for emulated processes:
//! - Memory classification types (state, permission, attribute)
//! - Block tracking: a gapless tiling of the address space
//! - Region layout with ASLR
//! - The page-table controller that keeps the host backend and the block
//!   tree in lockstep
//!
//! ## Collaborators
//!
//! The controller never reaches for globals. Physical page allocation,
//! quota accounting, randomness and the host backend are injected through
//! [`page_table::Collaborators`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod guard;
pub mod page_table;
pub mod physical;
pub mod protection;
pub mod random;
pub mod region;
pub mod resource_limit;
pub mod state;
pub mod virtual_memory;

#[cfg(test)]
mod testing;

use core::fmt;
use tessera_hal::HalError;

pub use page_table::{Collaborators, PageTable, ProcessMemoryConfig};
pub use protection::{MemoryAttribute, MemoryPermission, SvcMemoryPermission};
pub use state::MemoryState;
pub use tessera_hal::{PhysAddr, VirtAddr, PAGE_BITS, PAGE_SIZE};
pub use virtual_memory::{MemoryBlock, MemoryBlockManager, MemoryInfo};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Existing classification fails a required filter
    InvalidCurrentMemory,
    /// Target lies outside or straddles its legal region
    InvalidMemoryRegion,
    /// Misaligned or overflowing address
    InvalidAddress,
    /// Misaligned, zero or overflowing size
    InvalidSize,
    /// No suitable free range, or growth exceeds its region
    OutOfMemory,
    /// Resource quota exhausted
    LimitReached,
    /// Operation illegal in the table's current mode
    InvalidState,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidCurrentMemory => "invalid current memory",
            Self::InvalidMemoryRegion => "invalid memory region",
            Self::InvalidAddress => "invalid address",
            Self::InvalidSize => "invalid size",
            Self::OutOfMemory => "out of memory",
            Self::LimitReached => "limit reached",
            Self::InvalidState => "invalid state",
        };
        f.write_str(msg)
    }
}

impl From<HalError> for MemError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => Self::OutOfMemory,
            HalError::InvalidAddress => Self::InvalidAddress,
            _ => Self::InvalidState,
        }
    }
}

/// Number of whole pages in `size` bytes
#[inline]
pub const fn pages_of(size: u64) -> u64 {
    size >> PAGE_BITS
}

/// Size in bytes of `num_pages` pages
#[inline]
pub const fn bytes_of(num_pages: u64) -> u64 {
    num_pages << PAGE_BITS
}
