//! # Node Allocation
//!
//! Index-addressed storage for block-tree nodes.

pub mod slab;

pub use slab::{Slab, SlabStats, SlotId};
