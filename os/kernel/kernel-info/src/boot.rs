//! # Kernel Boot Information
//!
//! The loader discovers physical memory and places the kernel image; this
//! module only describes what it hands over. The core treats it as opaque
//! configuration consumed once by the frame allocator and the kernel root
//! builder.

use kernel_memory_addresses::{FrameNumber, PAGE_SHIFT, PhysicalAddress, VirtualAddress};

/// What a physical memory range may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// General purpose RAM handed to the frame allocator.
    Usable,
    /// Firmware, MMIO or otherwise off-limits.
    Reserved,
    /// Occupied by the kernel image; mapped but never allocated.
    KernelImage,
}

/// One entry of the boot memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    /// Length in **bytes**.
    pub len: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: PhysicalAddress, len: u64, kind: MemoryRegionKind) -> Self {
        Self { base, len, kind }
    }

    /// First byte past the region.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64().saturating_add(self.len))
    }
}

/// Placement of the kernel image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    /// Where the image executes.
    pub virt_base: VirtualAddress,
    /// Where its bytes live in physical memory.
    pub phys_base: PhysicalAddress,
    /// Length in **bytes**.
    pub len: u64,
}

/// Runtime configuration supplied once at start-up.
#[derive(Copy, Clone, Debug)]
pub struct BootInfo<'a> {
    /// Physical memory map, in any order.
    pub memory_map: &'a [MemoryRegion],

    /// Offset at which all physical memory appears in the kernel half.
    pub direct_map_offset: u64,

    /// Kernel image placement, if the kernel runs from a separate mapping.
    pub kernel_image: Option<KernelImage>,
}

impl BootInfo<'_> {
    /// One past the highest frame backed by RAM (usable or kernel image).
    ///
    /// The frame allocator sizes its bookkeeping to this value.
    #[must_use]
    pub fn frame_limit(&self) -> FrameNumber {
        let end = self
            .memory_map
            .iter()
            .filter(|r| r.kind != MemoryRegionKind::Reserved)
            .map(|r| r.end().as_u64())
            .max()
            .unwrap_or(0);
        FrameNumber::new(end >> PAGE_SHIFT)
    }

    /// Total bytes of usable RAM.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .map(|r| r.len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_ignores_reserved_ranges() {
        let map = [
            MemoryRegion::new(PhysicalAddress::new(0), 0x10_0000, MemoryRegionKind::Usable),
            MemoryRegion::new(
                PhysicalAddress::new(0x10_0000),
                0x2_0000,
                MemoryRegionKind::KernelImage,
            ),
            MemoryRegion::new(
                PhysicalAddress::new(0xFEE0_0000),
                0x1000,
                MemoryRegionKind::Reserved,
            ),
        ];
        let boot = BootInfo {
            memory_map: &map,
            direct_map_offset: crate::memory::DIRECT_MAP_BASE,
            kernel_image: None,
        };
        assert_eq!(boot.frame_limit(), FrameNumber::new(0x120));
        assert_eq!(boot.usable_bytes(), 0x10_0000);
    }
}
