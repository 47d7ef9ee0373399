//! # Direct-map based `PhysMapper`
//!
//! This module provides a [`PhysMapper`] implementation for kernels that see
//! all of physical memory at a fixed offset (the direct map, also known as
//! HHDM). It converts a physical address to a usable pointer in the current
//! virtual address space.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses, not physical ones.
//! - Page tables, frames being zeroed or copied for copy-on-write, and user
//!   pages written by the kernel are all identified by their physical
//!   address.
//! - The offset is runtime configuration handed over at boot; host tests
//!   use the address of a heap buffer instead.
//!
//! ## How does it work?
//! Every physical address `pa` is visible at `offset + pa`. The mapping is
//! established once by [`AddressSpace::new_kernel`](kernel_vmem::AddressSpace::new_kernel)
//! and shared by every address space through the kernel half.

use kernel_info::boot::BootInfo;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a direct map at a fixed offset.
///
/// # Safety
/// - The direct map must be present and cover every frame that is accessed.
/// - The returned pointers must only be used for valid, mapped and writable memory.
///
/// # Example
/// ```rust
/// use kernel_alloc::phys_mapper::DirectMapMapper;
/// use kernel_memory_addresses::PhysicalAddress;
/// use kernel_vmem::PhysMapper;
///
/// let mapper = DirectMapMapper::new(0xffff_8880_0000_0000);
/// let va = mapper.phys_to_virt(PhysicalAddress::new(0x1234_5000));
/// assert_eq!(va.as_u64(), 0xffff_8880_1234_5000);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DirectMapMapper {
    offset: u64,
}

impl DirectMapMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Use the offset from the boot handoff.
    #[must_use]
    pub const fn from_boot(boot: &BootInfo<'_>) -> Self {
        Self::new(boot.direct_map_offset)
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl PhysMapper for DirectMapMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}
