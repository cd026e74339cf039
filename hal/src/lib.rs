//! # Tessera HAL - Host Translation Abstraction
//!
//! This crate defines the boundary between the guest memory manager and the
//! host that actually backs guest memory.
//!
//! ## Contents
//!
//! - **Addresses**: [`VirtAddr`] and [`PhysAddr`] newtypes with page helpers
//! - **Backing**: the [`mmu::MemoryBacking`] trait every host backend implements
//! - **Software MMU**: [`mmu::SoftwareMmu`], a pure-software backend with a
//!   shared physical byte store

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod mmu;

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this backend
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// Backend ran out of memory
    OutOfMemory,
    /// Target range is already mapped
    AlreadyMapped,
    /// Target range is not mapped
    NotMapped,
    /// Host refused the access
    PermissionDenied,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotSupported => "operation not supported",
            Self::InvalidParameter => "invalid parameter",
            Self::InvalidAddress => "invalid address",
            Self::OutOfMemory => "out of memory",
            Self::AlreadyMapped => "range already mapped",
            Self::NotMapped => "range not mapped",
            Self::PermissionDenied => "permission denied",
        };
        f.write_str(msg)
    }
}

/// Number of bits in a page offset
pub const PAGE_BITS: u32 = 12;

/// Size of one guest page in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

static_assertions::const_assert_eq!(PAGE_SIZE, 0x1000);

/// Physical address type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Check if the address is page aligned
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// Page frame number of this address
    #[inline]
    pub const fn frame_number(self) -> u64 {
        self.0 >> PAGE_BITS
    }
}

/// Virtual address type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Check if the address is page aligned
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// Align the address up to the given power-of-two alignment
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given power-of-two alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add an offset, returning `None` on overflow
    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Offset of this address inside its page
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Page number of this address
    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_BITS
    }
}

macro_rules! impl_address_ops {
    ($ty:ident) => {
        impl Add<u64> for $ty {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $ty {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<u64> for $ty {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u64) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<u64> for $ty {
            #[inline]
            fn sub_assign(&mut self, rhs: u64) {
                self.0 -= rhs;
            }
        }

        /// Distance in bytes between two addresses
        impl Sub<$ty> for $ty {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $ty) -> u64 {
                self.0 - rhs.0
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

impl_address_ops!(VirtAddr);
impl_address_ops!(PhysAddr);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let addr = VirtAddr::new(0x8001234);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.align_down(PAGE_SIZE), VirtAddr::new(0x8001000));
        assert_eq!(addr.align_up(PAGE_SIZE), VirtAddr::new(0x8002000));
        assert_eq!(addr.align_up(0x200000), VirtAddr::new(0x8200000));
        assert_eq!(addr.page_offset(), 0x234);
        assert_eq!(addr.page_number(), 0x8001);
    }

    #[test]
    fn test_arithmetic() {
        let base = VirtAddr::new(0x1000);
        let end = base + 0x3000;
        assert_eq!(end - base, 0x3000);
        assert_eq!(end - 0x1000u64, VirtAddr::new(0x3000));
        assert_eq!(VirtAddr::new(u64::MAX).checked_add(1), None);

        let mut cursor = PhysAddr::new(0x10000);
        cursor += PAGE_SIZE;
        assert_eq!(cursor.frame_number(), 0x11);
    }

    #[test]
    fn test_display() {
        use alloc::format;
        assert_eq!(format!("{}", VirtAddr::new(0x8000000)), "0x8000000");
        assert_eq!(format!("{:x}", PhysAddr::new(0xabc)), "abc");
        assert_eq!(format!("{}", HalError::NotMapped), "range not mapped");
    }
}
