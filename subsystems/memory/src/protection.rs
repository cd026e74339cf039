//! # Memory Protection
//!
//! Permission and attribute flags tracked per block, plus the conversion
//! from the syscall-facing permission value.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use tessera_hal::mmu::HostProtection;

/// Shift from user permission bits to their kernel mirrors
const KERNEL_SHIFT: u8 = 3;

bitflags! {
    /// Permission of a guest range, split into user and kernel groups
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u8 {
        /// User read
        const READ = 1 << 0;
        /// User write
        const WRITE = 1 << 1;
        /// User execute
        const EXECUTE = 1 << 2;

        /// Kernel read
        const KERNEL_READ = Self::READ.bits() << KERNEL_SHIFT;
        /// Kernel write
        const KERNEL_WRITE = Self::WRITE.bits() << KERNEL_SHIFT;
        /// Kernel execute
        const KERNEL_EXECUTE = Self::EXECUTE.bits() << KERNEL_SHIFT;

        /// Range is not mapped for the user
        const NOT_MAPPED = 1 << (2 * KERNEL_SHIFT);

        /// Read as seen from user mode (kernel may read too)
        const USER_READ = Self::READ.bits() | Self::KERNEL_READ.bits();
        /// Write as seen from user mode (kernel may write too)
        const USER_WRITE = Self::WRITE.bits() | Self::KERNEL_WRITE.bits();
        /// Execute as seen from user mode
        const USER_EXECUTE = Self::EXECUTE.bits();

        /// User read + write
        const USER_READ_WRITE = Self::USER_READ.bits() | Self::USER_WRITE.bits();
        /// User read + execute
        const USER_READ_EXECUTE = Self::USER_READ.bits() | Self::USER_EXECUTE.bits();

        /// Kernel read + write
        const KERNEL_READ_WRITE = Self::KERNEL_READ.bits() | Self::KERNEL_WRITE.bits();
        /// Kernel read + execute
        const KERNEL_READ_EXECUTE = Self::KERNEL_READ.bits() | Self::KERNEL_EXECUTE.bits();

        /// Bits an IPC lock is allowed to replace
        const IPC_LOCK_CHANGE_MASK = Self::NOT_MAPPED.bits() | Self::USER_READ_WRITE.bits();

        /// User permission bits
        const USER_MASK = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryPermission {
    /// No access at all
    pub const NONE: Self = Self::empty();

    /// Every bit set, used as a "compare everything" mask
    pub const ALL: Self = Self::from_bits_retain(u8::MAX);

    /// Check that `self & mask == expected`
    #[inline]
    pub const fn matches(self, mask: Self, expected: Self) -> bool {
        self.bits() & mask.bits() == expected.bits()
    }

    /// Whether user code may write
    #[inline]
    pub const fn is_user_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Whether user code may execute
    #[inline]
    pub const fn is_user_executable(self) -> bool {
        self.contains(Self::EXECUTE)
    }

    /// Protection the host backend should apply for user access
    pub fn host_protection(self) -> HostProtection {
        let mut prot = HostProtection::empty();
        if self.contains(Self::NOT_MAPPED) {
            return prot;
        }
        if self.contains(Self::READ) {
            prot |= HostProtection::READ;
        }
        if self.contains(Self::WRITE) {
            prot |= HostProtection::WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= HostProtection::EXECUTE;
        }
        prot
    }
}

const_assert_eq!(MemoryPermission::KERNEL_READ.bits(), 0x08);
const_assert_eq!(MemoryPermission::NOT_MAPPED.bits(), 0x40);
const_assert_eq!(MemoryPermission::USER_READ_WRITE.bits(), 0x1B);
const_assert_eq!(MemoryPermission::USER_READ_EXECUTE.bits(), 0x0D);
const_assert_eq!(MemoryPermission::IPC_LOCK_CHANGE_MASK.bits(), 0x5B);

bitflags! {
    /// Permission value as passed through the syscall layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SvcMemoryPermission: u32 {
        /// Read
        const READ = 1 << 0;
        /// Write
        const WRITE = 1 << 1;
        /// Execute
        const EXECUTE = 1 << 2;
        /// Read + Write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Execute
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Sentinel: leave the permission untouched
        const DONT_CARE = 1 << 28;
    }
}

impl SvcMemoryPermission {
    /// No access
    pub const NONE: Self = Self::empty();
}

impl From<SvcMemoryPermission> for MemoryPermission {
    /// Kernel read is always granted; kernel write mirrors user write; an
    /// empty permission becomes not-mapped.
    fn from(svc: SvcMemoryPermission) -> Self {
        let user = (svc.bits() & u32::from(Self::USER_MASK.bits())) as u8;
        let write = if svc.contains(SvcMemoryPermission::WRITE) {
            Self::KERNEL_WRITE
        } else {
            Self::NONE
        };
        let not_mapped = if svc == SvcMemoryPermission::NONE {
            Self::NOT_MAPPED
        } else {
            Self::NONE
        };

        Self::from_bits_retain(user) | Self::KERNEL_READ | write | not_mapped
    }
}

bitflags! {
    /// Attribute bits of a guest range
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAttribute: u8 {
        /// Locked by transfer/code memory or an alias
        const LOCKED = 1 << 0;
        /// Locked by an in-flight IPC transfer
        const IPC_LOCKED = 1 << 1;
        /// Shared with a device address space
        const DEVICE_SHARED = 1 << 2;
        /// Mapped uncached
        const UNCACHED = 1 << 3;

        /// All meaningful bits
        const MASK = 0x7F;
        /// Sentinel that never matches a stored attribute
        const DONT_CARE_MASK = 0x80;

        /// IPC locked or device shared
        const IPC_AND_DEVICE_MAPPED = Self::IPC_LOCKED.bits() | Self::DEVICE_SHARED.bits();
        /// Locked or IPC locked
        const LOCKED_AND_IPC_LOCKED = Self::LOCKED.bits() | Self::IPC_LOCKED.bits();
        /// Device shared or uncached
        const DEVICE_SHARED_AND_UNCACHED = Self::DEVICE_SHARED.bits() | Self::UNCACHED.bits();

        /// Bits the owner may set through the attribute syscall
        const SET_MASK = Self::UNCACHED.bits();
    }
}

impl MemoryAttribute {
    /// No attribute
    pub const NONE: Self = Self::empty();

    /// Check that `self & mask == expected`
    #[inline]
    pub const fn matches(self, mask: Self, expected: Self) -> bool {
        self.bits() & mask.bits() == expected.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_svc_conversion() {
        assert_eq!(
            MemoryPermission::from(SvcMemoryPermission::READ_WRITE),
            MemoryPermission::USER_READ_WRITE
        );
        assert_eq!(
            MemoryPermission::from(SvcMemoryPermission::READ_EXECUTE),
            MemoryPermission::USER_READ_EXECUTE
        );
        assert_eq!(
            MemoryPermission::from(SvcMemoryPermission::READ),
            MemoryPermission::USER_READ
        );
        assert_eq!(
            MemoryPermission::from(SvcMemoryPermission::NONE),
            MemoryPermission::KERNEL_READ | MemoryPermission::NOT_MAPPED
        );
    }

    #[test]
    fn test_host_protection() {
        assert_eq!(MemoryPermission::USER_READ_WRITE.host_protection(), HostProtection::RW);
        assert_eq!(MemoryPermission::USER_READ_EXECUTE.host_protection(), HostProtection::RX);
        assert!(MemoryPermission::NOT_MAPPED
            .union(MemoryPermission::KERNEL_READ_WRITE)
            .host_protection()
            .is_empty());
    }

    #[test]
    fn test_attribute_masks() {
        let attr = MemoryAttribute::DEVICE_SHARED | MemoryAttribute::UNCACHED;
        assert!(attr.matches(MemoryAttribute::LOCKED_AND_IPC_LOCKED, MemoryAttribute::NONE));
        assert!(!attr.matches(MemoryAttribute::MASK, MemoryAttribute::NONE));
        assert_eq!(MemoryAttribute::SET_MASK, MemoryAttribute::UNCACHED);
    }

    #[test]
    fn test_permission_predicates() {
        assert!(MemoryPermission::USER_READ_WRITE.is_user_writable());
        assert!(!MemoryPermission::USER_READ_WRITE.is_user_executable());
        assert!(MemoryPermission::USER_READ_EXECUTE.matches(
            MemoryPermission::USER_MASK,
            MemoryPermission::READ | MemoryPermission::EXECUTE
        ));
    }
}
