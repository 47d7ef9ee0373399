use kernel_alloc::{BitmapFrameAlloc, FrameAllocError};
use kernel_info::memory::{PAGE_SIZE, TASK_KERNEL_STACK_SIZE};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_vmem::PhysMapper;
use log::{trace, warn};

/// The privileged stack of one task.
///
/// Backed by physically contiguous frames and reached through the direct
/// map, so it is visible in every address space without any mapping work.
///
/// # Layout
/// ```text
/// [ TASK_KERNEL_STACK_SIZE bytes of direct-mapped frames ]
/// ^ base (lowest frame)                                  ^ top (16 B aligned)
/// ```
///
/// There is no guard page: the direct map has none to leave unmapped.
#[derive(Debug, Eq, PartialEq)]
pub struct KernelStack {
    base: PhysicalPage,
    top: VirtualAddress,
}

impl KernelStack {
    const FRAMES: u64 = TASK_KERNEL_STACK_SIZE / PAGE_SIZE;

    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no contiguous run is free.
    pub fn allocate(
        frames: &mut BitmapFrameAlloc,
        mapper: &impl PhysMapper,
    ) -> Result<Self, FrameAllocError> {
        let base = frames.allocate_contiguous(Self::FRAMES)?;
        let bottom = mapper.phys_to_virt(base.base()).as_u64();
        let top = VirtualAddress::new((bottom + TASK_KERNEL_STACK_SIZE) & !0xFu64);
        trace!("kernel stack {base:?} top {top}");
        Ok(Self { base, top })
    }

    /// Initial stack pointer; the stack grows down from here.
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    /// Hand the frames back.
    pub fn release(self, frames: &mut BitmapFrameAlloc) {
        if let Err(e) = frames.free_contiguous(self.base, Self::FRAMES) {
            warn!("kernel stack {:?} not released: {e}", self.base);
        }
    }
}
