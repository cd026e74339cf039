//! # Address Space Regions
//!
//! Fixed-purpose sub-ranges of a process address space and the layout
//! computation that places them, optionally at randomized offsets.

use crate::random::RandomSource;
use crate::{MemError, MemResult};
use core::fmt;
use tessera_hal::VirtAddr;

/// One mebibyte
pub const MIB: u64 = 1 << 20;
/// One gibibyte
pub const GIB: u64 = 1 << 30;

/// Placement granularity of the variable regions
pub const REGION_ALIGNMENT: u64 = 2 * MIB;

/// Address-space flavour requested by a program image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressSpaceType {
    /// 32-bit space
    Is32Bit,
    /// 32-bit space without an alias region
    Is32BitNoMap,
    /// 36-bit space
    Is36Bit,
    /// 39-bit space
    #[default]
    Is39Bit,
}

impl AddressSpaceType {
    /// Address-space width in bits
    pub const fn width(self) -> u32 {
        match self {
            Self::Is32Bit | Self::Is32BitNoMap => 32,
            Self::Is36Bit => 36,
            Self::Is39Bit => 39,
        }
    }
}

/// Entry kinds of the [`AddressSpaceInfo`] table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceInfoType {
    /// Small map area
    Is32Bit,
    /// Large map area of the narrow layouts
    Small64Bit,
    /// Code area of the 39-bit layout
    Large64Bit,
    /// Heap size
    Heap,
    /// Stack size
    Stack,
    /// Alias size
    Alias,
}

/// One row of the per-width region table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceInfo {
    /// Address-space width
    pub width: u32,
    /// Fixed start, when the region has one
    pub start: Option<u64>,
    /// Size in bytes
    pub size: u64,
    /// Entry kind
    pub kind: AddressSpaceInfoType,
}

impl AddressSpaceInfo {
    const fn new(width: u32, start: Option<u64>, size: u64, kind: AddressSpaceInfoType) -> Self {
        Self {
            width,
            start,
            size,
            kind,
        }
    }

    /// Table row for `width` and `kind`
    pub fn get(width: u32, kind: AddressSpaceInfoType) -> Option<&'static AddressSpaceInfo> {
        ADDRESS_SPACE_INFOS
            .iter()
            .find(|info| info.width == width && info.kind == kind)
    }

    /// Region size, zero when the width has no such region
    pub fn size_of(width: u32, kind: AddressSpaceInfoType) -> u64 {
        Self::get(width, kind).map_or(0, |info| info.size)
    }

    /// Fixed region start, zero when the region floats
    pub fn start_of(width: u32, kind: AddressSpaceInfoType) -> u64 {
        Self::get(width, kind).and_then(|info| info.start).unwrap_or(0)
    }
}

use AddressSpaceInfoType as Kind;

static ADDRESS_SPACE_INFOS: [AddressSpaceInfo; 13] = [
    AddressSpaceInfo::new(32, Some(2 * MIB), GIB - 2 * MIB, Kind::Is32Bit),
    AddressSpaceInfo::new(32, Some(GIB), 4 * GIB - GIB, Kind::Small64Bit),
    AddressSpaceInfo::new(32, None, GIB, Kind::Heap),
    AddressSpaceInfo::new(32, None, GIB, Kind::Alias),
    AddressSpaceInfo::new(36, Some(128 * MIB), 2 * GIB - 128 * MIB, Kind::Is32Bit),
    AddressSpaceInfo::new(36, Some(2 * GIB), 64 * GIB - 2 * GIB, Kind::Small64Bit),
    AddressSpaceInfo::new(36, None, 6 * GIB, Kind::Heap),
    AddressSpaceInfo::new(36, None, 6 * GIB, Kind::Alias),
    AddressSpaceInfo::new(39, Some(128 * MIB), 512 * GIB - 128 * MIB, Kind::Large64Bit),
    AddressSpaceInfo::new(39, None, 64 * GIB, Kind::Is32Bit),
    AddressSpaceInfo::new(39, None, 6 * GIB, Kind::Heap),
    AddressSpaceInfo::new(39, None, 64 * GIB, Kind::Alias),
    AddressSpaceInfo::new(39, None, 2 * GIB, Kind::Stack),
];

/// Half-open address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// First address
    pub start: VirtAddr,
    /// End address (exclusive)
    pub end: VirtAddr,
}

impl Region {
    /// Create a region from a start and a size
    pub const fn new(start: u64, size: u64) -> Self {
        Self {
            start: VirtAddr::new(start),
            end: VirtAddr::new(start + size),
        }
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `addr` lies in the region
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether `[addr, addr + size)` lies entirely in the region
    pub fn contains_range(&self, addr: VirtAddr, size: u64) -> bool {
        match addr.checked_add(size) {
            Some(end) => self.start <= addr && addr < end && end <= self.end,
            None => false,
        }
    }

    /// Whether `[addr, addr + size)` shares any address with the region
    pub fn overlaps_range(&self, addr: VirtAddr, size: u64) -> bool {
        let end = addr.checked_add(size).unwrap_or(VirtAddr::new(u64::MAX));
        !self.is_empty() && addr < self.end && self.start < end
    }

    /// Whether two regions share any address
    pub fn overlaps(&self, other: &Region) -> bool {
        other.overlaps_range(self.start, self.size())
    }

    fn shift(&mut self, by: u64) {
        self.start += by;
        self.end += by;
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Region boundaries of one process address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Address-space width in bits
    pub width: u32,
    /// Whole address space
    pub address_space: Region,
    /// Area the process image is loaded into
    pub code: Region,
    /// Area for code aliases and shared mappings
    pub alias_code: Region,
    /// Alias (IPC and physical memory) region
    pub alias: Region,
    /// Heap region
    pub heap: Region,
    /// Stack region
    pub stack: Region,
    /// Kernel-map region (thread-local and static mappings)
    pub kernel_map: Region,
}

impl RegionLayout {
    /// Place every region of a process address space
    ///
    /// The code image fixes the code region. The alias, heap, stack and
    /// kernel-map regions are packed into whichever side of the image has
    /// more room, each at its own random offset when `aslr` is set.
    pub fn compute(
        as_type: AddressSpaceType,
        code_addr: VirtAddr,
        code_size: u64,
        aslr: bool,
        random: &dyn RandomSource,
    ) -> MemResult<Self> {
        let width = as_type.width();
        let space = Region::new(0, 1 << width);

        if code_size == 0 {
            return Err(MemError::InvalidSize);
        }
        if !space.contains_range(code_addr, code_size) {
            return Err(MemError::InvalidMemoryRegion);
        }

        let mut alias_size = AddressSpaceInfo::size_of(width, Kind::Alias);
        let mut heap_size = AddressSpaceInfo::size_of(width, Kind::Heap);
        if as_type == AddressSpaceType::Is32BitNoMap {
            heap_size += alias_size;
            alias_size = 0;
        }

        let stack_size;
        let kernel_map_size;
        let code;
        let alias_code;
        let process_code;
        let mut stack = Region::default();
        let mut kernel_map = Region::default();

        if width == 39 {
            stack_size = AddressSpaceInfo::size_of(width, Kind::Stack);
            kernel_map_size = AddressSpaceInfo::size_of(width, Kind::Is32Bit);
            code = Region::new(
                AddressSpaceInfo::start_of(width, Kind::Large64Bit),
                AddressSpaceInfo::size_of(width, Kind::Large64Bit),
            );
            alias_code = code;
            process_code = Region {
                start: code_addr.align_down(REGION_ALIGNMENT),
                end: (code_addr + code_size).align_up(REGION_ALIGNMENT),
            };
        } else {
            stack_size = 0;
            kernel_map_size = 0;
            code = Region::new(
                AddressSpaceInfo::start_of(width, Kind::Is32Bit),
                AddressSpaceInfo::size_of(width, Kind::Is32Bit),
            );
            let large = Region::new(
                AddressSpaceInfo::start_of(width, Kind::Small64Bit),
                AddressSpaceInfo::size_of(width, Kind::Small64Bit),
            );
            alias_code = Region {
                start: code.start,
                end: large.end,
            };
            stack = code;
            kernel_map = code;
            process_code = code;
        }

        if process_code.start < code.start || process_code.end > space.end {
            return Err(MemError::InvalidMemoryRegion);
        }

        let below = process_code.start - code.start;
        let above = space.end - process_code.end;
        let (alloc_start, alloc_size) = if below >= above {
            (code.start, below)
        } else {
            (process_code.end, above)
        };

        let needed = alias_size + heap_size + stack_size + kernel_map_size;
        if alloc_size < needed {
            log::debug!(
                "{}-bit layout needs {:#x} bytes beside the code image, only {:#x} available",
                width,
                needed,
                alloc_size
            );
            return Err(MemError::OutOfMemory);
        }
        let remaining = alloc_size - needed;

        let offset = || {
            if aslr {
                random.generate_random_range(0, remaining / REGION_ALIGNMENT) * REGION_ALIGNMENT
            } else {
                0
            }
        };
        let alias_rnd = offset();
        let heap_rnd = offset();
        let stack_rnd = offset();
        let kmap_rnd = offset();

        let base = alloc_start.as_u64();
        let mut alias = Region::new(base + alias_rnd, alias_size);
        let mut heap = Region::new(base + heap_rnd, heap_size);

        if alias_rnd <= heap_rnd {
            heap.shift(alias_size);
        } else {
            alias.shift(heap_size);
        }

        if stack_size > 0 {
            stack = Region::new(base + stack_rnd, stack_size);
            if alias_rnd < stack_rnd {
                stack.shift(alias_size);
            } else {
                alias.shift(stack_size);
            }
            if heap_rnd < stack_rnd {
                stack.shift(heap_size);
            } else {
                heap.shift(stack_size);
            }
        }

        if kernel_map_size > 0 {
            kernel_map = Region::new(base + kmap_rnd, kernel_map_size);
            if alias_rnd < kmap_rnd {
                kernel_map.shift(alias_size);
            } else {
                alias.shift(kernel_map_size);
            }
            if heap_rnd < kmap_rnd {
                kernel_map.shift(heap_size);
            } else {
                heap.shift(kernel_map_size);
            }
            if stack_size > 0 {
                if stack_rnd < kmap_rnd {
                    kernel_map.shift(stack_size);
                } else {
                    stack.shift(kernel_map_size);
                }
            }
        }

        let layout = Self {
            width,
            address_space: space,
            code,
            alias_code,
            alias,
            heap,
            stack,
            kernel_map,
        };
        layout.assert_valid();

        log::info!(
            "{}-bit address space: code {} alias {} heap {} stack {} kernel map {}",
            width,
            layout.code,
            layout.alias,
            layout.heap,
            layout.stack,
            layout.kernel_map
        );
        Ok(layout)
    }

    /// Whether the variable regions are in bounds and pairwise disjoint
    pub fn is_valid(&self) -> bool {
        let space = &self.address_space;
        let in_space = |r: &Region| space.start <= r.start && r.start <= r.end && r.end <= space.end;

        let variable = [&self.alias, &self.heap, &self.stack, &self.kernel_map];
        if !variable.iter().all(|r| in_space(*r)) {
            return false;
        }

        // Narrow layouts reuse the code region for stack and kernel map
        let floating = if self.width == 39 { &variable[..] } else { &variable[..2] };
        floating
            .iter()
            .enumerate()
            .all(|(i, a)| floating[i + 1..].iter().all(|b| !a.overlaps(b)))
    }

    fn assert_valid(&self) {
        assert!(self.is_valid(), "region layout out of bounds or overlapping: {:?}", self);
    }
}
