//! # Virtual Memory Blocks
//!
//! Bookkeeping for the guest address space: what every page is, who may
//! touch it, and which locks are outstanding on it.

pub mod block;
pub mod block_manager;
pub mod update_allocator;

pub use block::{MemoryBlock, MemoryInfo};
pub use block_manager::MemoryBlockManager;
pub use update_allocator::{UpdateAllocator, MAX_BLOCKS_PER_UPDATE, MAX_UPDATES_PER_RESERVATION};
