use crate::address_space::{AddressSpace, MapError};
use crate::page_table::{PageTableEntry, TableIndex, TableLevel};
use crate::{FrameAlloc, PageFlags, PhysMapper};
use kernel_info::boot::{BootInfo, MemoryRegionKind};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage, align_down,
    checked_align_up,
};
use log::info;

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Build the process-wide kernel root.
    ///
    /// Maps every non-reserved physical range at `boot.direct_map_offset +
    /// pa` and the kernel image at its link address. Every kernel-half PML4
    /// slot is populated with a (possibly empty) PDPT so user roots created
    /// later share the whole kernel half by reference.
    ///
    /// The direct map does not hold frame references: it aliases all of RAM
    /// and is never torn down.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the tables don't fit.
    pub fn new_kernel<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        boot: &BootInfo<'_>,
    ) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(TableLevel::Pml4))?;
        mapper.zero_frame(root);
        let space = Self::from_root(mapper, root);

        let pml4 = space.table_mut(root);
        for i in TableIndex::kernel_half() {
            let pdpt = space.alloc_table(alloc, TableLevel::Pdpt)?;
            pml4.set(i, PageTableEntry::table(pdpt, false));
        }

        let mut mapped = 0u64;
        for region in boot
            .memory_map
            .iter()
            .filter(|r| r.kind != MemoryRegionKind::Reserved)
        {
            let start = align_down(region.base.as_u64(), PAGE_SIZE);
            let end = checked_align_up(region.end().as_u64(), PAGE_SIZE).unwrap_or(u64::MAX);
            for pa in (start..end).step_by(PAGE_SIZE as usize) {
                let va = VirtualAddress::new(boot.direct_map_offset + pa);
                space.map(
                    alloc,
                    VirtualPage::containing(va),
                    PhysicalPage::containing(PhysicalAddress::new(pa)),
                    PageFlags::KERNEL_DATA,
                )?;
                mapped += 1;
            }
        }

        if let Some(image) = boot.kernel_image {
            let pages = image.len.div_ceil(PAGE_SIZE);
            for i in 0..pages {
                let va = image.virt_base + i * PAGE_SIZE;
                let pa = image.phys_base + i * PAGE_SIZE;
                space.map(
                    alloc,
                    VirtualPage::containing(va),
                    PhysicalPage::containing(pa),
                    PageFlags::KERNEL_IMAGE,
                )?;
            }
        }

        info!(
            "kernel root {root:?}: {mapped} direct-mapped frames at {:#x}",
            boot.direct_map_offset
        );
        Ok(space)
    }
}
