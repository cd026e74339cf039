//! # Memory State
//!
//! Classification of a guest range: a discriminant in the low byte plus a
//! set of capability flags describing what the range may take part in.
//! The encoding is the guest ABI value reported through memory queries.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

bitflags! {
    /// Memory state (discriminant + capability flags)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryState: u32 {
        /// Discriminant bits
        const MASK = 0xFF;

        /// Permission may be changed by the owner
        const FLAG_CAN_REPROTECT = 1 << 8;
        /// Debugger may access the range
        const FLAG_CAN_DEBUG = 1 << 9;
        /// May back an IPC buffer
        const FLAG_CAN_USE_IPC = 1 << 10;
        /// May back a non-device IPC buffer
        const FLAG_CAN_USE_NON_DEVICE_IPC = 1 << 11;
        /// May back a non-secure IPC buffer
        const FLAG_CAN_USE_NON_SECURE_IPC = 1 << 12;
        /// Range is backed by physical memory
        const FLAG_MAPPED = 1 << 13;
        /// Range holds code
        const FLAG_CODE = 1 << 14;
        /// May be aliased into the stack region
        const FLAG_CAN_ALIAS = 1 << 15;
        /// May be aliased as code
        const FLAG_CAN_CODE_ALIAS = 1 << 16;
        /// May back transfer memory
        const FLAG_CAN_TRANSFER = 1 << 17;
        /// Physical address may be queried
        const FLAG_CAN_QUERY_PHYSICAL = 1 << 18;
        /// May be mapped into a device address space
        const FLAG_CAN_DEVICE_MAP = 1 << 19;
        /// May be mapped into a device address space with alignment
        const FLAG_CAN_ALIGNED_DEVICE_MAP = 1 << 20;
        /// May back an IPC user buffer
        const FLAG_CAN_IPC_USER_BUFFER = 1 << 21;
        /// Backing pages are reference counted
        const FLAG_REFERENCE_COUNTED = 1 << 22;
        /// May be mapped into another process
        const FLAG_CAN_MAP_PROCESS = 1 << 23;
        /// Attributes may be changed by the owner
        const FLAG_CAN_CHANGE_ATTRIBUTE = 1 << 24;
        /// May back code memory
        const FLAG_CAN_CODE_MEMORY = 1 << 25;

        /// Flags shared by every data-like state
        const FLAGS_DATA = Self::FLAG_CAN_REPROTECT.bits() | Self::FLAG_CAN_USE_IPC.bits()
            | Self::FLAG_CAN_USE_NON_DEVICE_IPC.bits() | Self::FLAG_CAN_USE_NON_SECURE_IPC.bits()
            | Self::FLAG_MAPPED.bits() | Self::FLAG_CAN_ALIAS.bits() | Self::FLAG_CAN_TRANSFER.bits()
            | Self::FLAG_CAN_QUERY_PHYSICAL.bits() | Self::FLAG_CAN_DEVICE_MAP.bits()
            | Self::FLAG_CAN_ALIGNED_DEVICE_MAP.bits() | Self::FLAG_CAN_IPC_USER_BUFFER.bits()
            | Self::FLAG_REFERENCE_COUNTED.bits() | Self::FLAG_CAN_CHANGE_ATTRIBUTE.bits();

        /// Flags shared by every code-like state
        const FLAGS_CODE = Self::FLAG_CAN_DEBUG.bits() | Self::FLAG_CAN_USE_IPC.bits()
            | Self::FLAG_CAN_USE_NON_DEVICE_IPC.bits() | Self::FLAG_CAN_USE_NON_SECURE_IPC.bits()
            | Self::FLAG_MAPPED.bits() | Self::FLAG_CODE.bits() | Self::FLAG_CAN_QUERY_PHYSICAL.bits()
            | Self::FLAG_CAN_DEVICE_MAP.bits() | Self::FLAG_CAN_ALIGNED_DEVICE_MAP.bits()
            | Self::FLAG_REFERENCE_COUNTED.bits();

        /// Flags of states that are mapped but otherwise unusable
        const FLAGS_MISC = Self::FLAG_MAPPED.bits() | Self::FLAG_REFERENCE_COUNTED.bits()
            | Self::FLAG_CAN_QUERY_PHYSICAL.bits() | Self::FLAG_CAN_DEVICE_MAP.bits();
    }
}

impl MemoryState {
    /// Unmapped, available range
    pub const FREE: Self = Self::from_bits_retain(0x00);
    /// Device I/O mapping
    pub const IO: Self = Self::from_bits_retain(0x01).union(Self::FLAG_MAPPED);
    /// Static kernel mapping
    pub const STATIC: Self = Self::from_bits_retain(0x02)
        .union(Self::FLAG_MAPPED)
        .union(Self::FLAG_CAN_QUERY_PHYSICAL);
    /// Process code image
    pub const CODE: Self = Self::from_bits_retain(0x03)
        .union(Self::FLAGS_CODE)
        .union(Self::FLAG_CAN_MAP_PROCESS);
    /// Writable process code image
    pub const CODE_DATA: Self = Self::from_bits_retain(0x04)
        .union(Self::FLAGS_DATA)
        .union(Self::FLAG_CAN_MAP_PROCESS)
        .union(Self::FLAG_CAN_CODE_MEMORY);
    /// Shared memory
    pub const SHARED: Self = Self::from_bits_retain(0x06)
        .union(Self::FLAG_MAPPED)
        .union(Self::FLAG_REFERENCE_COUNTED);
    /// Heap and physical memory
    pub const NORMAL: Self = Self::from_bits_retain(0x05)
        .union(Self::FLAGS_DATA)
        .union(Self::FLAG_CAN_CODE_MEMORY);
    /// Code alias of heap memory
    pub const ALIAS_CODE: Self = Self::from_bits_retain(0x08)
        .union(Self::FLAGS_CODE)
        .union(Self::FLAG_CAN_MAP_PROCESS)
        .union(Self::FLAG_CAN_CODE_ALIAS);
    /// Writable code alias
    pub const ALIAS_CODE_DATA: Self = Self::from_bits_retain(0x09)
        .union(Self::FLAGS_DATA)
        .union(Self::FLAG_CAN_MAP_PROCESS)
        .union(Self::FLAG_CAN_CODE_ALIAS)
        .union(Self::FLAG_CAN_CODE_MEMORY);
    /// IPC buffer
    pub const IPC: Self = Self::from_bits_retain(0x0A)
        .union(Self::FLAGS_MISC)
        .union(Self::FLAG_CAN_ALIGNED_DEVICE_MAP)
        .union(Self::FLAG_CAN_USE_IPC)
        .union(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Stack alias of heap memory
    pub const STACK: Self = Self::from_bits_retain(0x0B)
        .union(Self::FLAGS_MISC)
        .union(Self::FLAG_CAN_ALIGNED_DEVICE_MAP)
        .union(Self::FLAG_CAN_USE_IPC)
        .union(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Thread-local storage
    pub const THREAD_LOCAL: Self = Self::from_bits_retain(0x0C)
        .union(Self::FLAG_MAPPED)
        .union(Self::FLAG_REFERENCE_COUNTED);
    /// Transfer memory mapping
    pub const TRANSFERRED: Self = Self::from_bits_retain(0x0D)
        .union(Self::FLAGS_MISC)
        .union(Self::FLAG_CAN_ALIGNED_DEVICE_MAP)
        .union(Self::FLAG_CAN_CHANGE_ATTRIBUTE)
        .union(Self::FLAG_CAN_USE_IPC)
        .union(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Shared transfer memory mapping
    pub const SHARED_TRANSFERRED: Self = Self::from_bits_retain(0x0E)
        .union(Self::FLAGS_MISC)
        .union(Self::FLAG_CAN_ALIGNED_DEVICE_MAP)
        .union(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Shared code mapping
    pub const SHARED_CODE: Self = Self::from_bits_retain(0x0F)
        .union(Self::FLAG_MAPPED)
        .union(Self::FLAG_REFERENCE_COUNTED)
        .union(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Reserved, never accessible
    pub const INACCESSIBLE: Self = Self::from_bits_retain(0x10);
    /// Non-secure IPC buffer
    pub const NON_SECURE_IPC: Self = Self::from_bits_retain(0x11)
        .union(Self::FLAGS_MISC)
        .union(Self::FLAG_CAN_ALIGNED_DEVICE_MAP)
        .union(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Non-device IPC buffer
    pub const NON_DEVICE_IPC: Self = Self::from_bits_retain(0x12)
        .union(Self::FLAGS_MISC)
        .union(Self::FLAG_CAN_USE_NON_DEVICE_IPC);
    /// Kernel-owned mapping
    pub const KERNEL: Self = Self::from_bits_retain(0x13).union(Self::FLAG_MAPPED);
    /// JIT-generated code
    pub const GENERATED_CODE: Self = Self::from_bits_retain(0x14)
        .union(Self::FLAG_MAPPED)
        .union(Self::FLAG_REFERENCE_COUNTED)
        .union(Self::FLAG_CAN_DEBUG);
    /// JIT code output
    pub const CODE_OUT: Self = Self::from_bits_retain(0x15)
        .union(Self::FLAG_MAPPED)
        .union(Self::FLAG_REFERENCE_COUNTED);

    /// Every bit set, used as a "compare everything" mask
    pub const ALL: Self = Self::from_bits_retain(u32::MAX);

    /// Discriminant without capability flags
    #[inline]
    pub const fn discriminant(self) -> u8 {
        (self.bits() & Self::MASK.bits()) as u8
    }

    /// Check that `self & mask == expected`
    #[inline]
    pub const fn matches(self, mask: Self, expected: Self) -> bool {
        self.bits() & mask.bits() == expected.bits()
    }

    /// Whether this is one of the IPC buffer states
    pub const fn is_ipc(self) -> bool {
        self.ipc_source_flag().is_some()
    }

    /// Capability flag an IPC buffer of this state requires from its source
    pub const fn ipc_source_flag(self) -> Option<Self> {
        if self.bits() == Self::IPC.bits() {
            Some(Self::FLAG_CAN_USE_IPC)
        } else if self.bits() == Self::NON_SECURE_IPC.bits() {
            Some(Self::FLAG_CAN_USE_NON_SECURE_IPC)
        } else if self.bits() == Self::NON_DEVICE_IPC.bits() {
            Some(Self::FLAG_CAN_USE_NON_DEVICE_IPC)
        } else {
            None
        }
    }

    /// Human-readable name of the discriminant
    pub const fn name(self) -> &'static str {
        match self.discriminant() {
            0x00 => "Free",
            0x01 => "Io",
            0x02 => "Static",
            0x03 => "Code",
            0x04 => "CodeData",
            0x05 => "Normal",
            0x06 => "Shared",
            0x08 => "AliasCode",
            0x09 => "AliasCodeData",
            0x0A => "Ipc",
            0x0B => "Stack",
            0x0C => "ThreadLocal",
            0x0D => "Transferred",
            0x0E => "SharedTransferred",
            0x0F => "SharedCode",
            0x10 => "Inaccessible",
            0x11 => "NonSecureIpc",
            0x12 => "NonDeviceIpc",
            0x13 => "Kernel",
            0x14 => "GeneratedCode",
            0x15 => "CodeOut",
            _ => "Unknown",
        }
    }
}

const_assert_eq!(MemoryState::FREE.bits(), 0x0000_0000);
const_assert_eq!(MemoryState::IO.bits(), 0x0000_2001);
const_assert_eq!(MemoryState::STATIC.bits(), 0x0004_2002);
const_assert_eq!(MemoryState::CODE.bits(), 0x00DC_7E03);
const_assert_eq!(MemoryState::CODE_DATA.bits(), 0x03FE_BD04);
const_assert_eq!(MemoryState::NORMAL.bits(), 0x037E_BD05);
const_assert_eq!(MemoryState::SHARED.bits(), 0x0040_2006);
const_assert_eq!(MemoryState::ALIAS_CODE.bits(), 0x00DD_7E08);
const_assert_eq!(MemoryState::ALIAS_CODE_DATA.bits(), 0x03FF_BD09);
const_assert_eq!(MemoryState::IPC.bits(), 0x005C_3C0A);
const_assert_eq!(MemoryState::STACK.bits(), 0x005C_3C0B);
const_assert_eq!(MemoryState::THREAD_LOCAL.bits(), 0x0040_200C);
const_assert_eq!(MemoryState::TRANSFERRED.bits(), 0x015C_3C0D);
const_assert_eq!(MemoryState::SHARED_TRANSFERRED.bits(), 0x005C_380E);
const_assert_eq!(MemoryState::SHARED_CODE.bits(), 0x0040_380F);
const_assert_eq!(MemoryState::INACCESSIBLE.bits(), 0x0000_0010);
const_assert_eq!(MemoryState::NON_SECURE_IPC.bits(), 0x005C_3811);
const_assert_eq!(MemoryState::NON_DEVICE_IPC.bits(), 0x004C_2812);
const_assert_eq!(MemoryState::KERNEL.bits(), 0x0000_2013);
const_assert_eq!(MemoryState::GENERATED_CODE.bits(), 0x0040_2214);
const_assert_eq!(MemoryState::CODE_OUT.bits(), 0x0040_2015);
