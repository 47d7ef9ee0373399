//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frames, the direct map and per-process virtual memory.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        User memory ([`vmm`], [`fault`])             │
//! │    • VMA list + page-table root per process         │
//! │    • mmap / munmap / brk, fork, copy to/from user   │
//! │    • demand paging and copy-on-write faults         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper ([`phys_mapper`])      │
//! │    • physical → virtual through the direct map      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Physical Frame Allocator ([`frame_alloc`])   │
//! │    • one bit per 4 KiB frame, first fit             │
//! │    • reference counts for shared frames             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! None of the types here lock. The owner keeps the frame allocator behind
//! one lock and each [`UserMemory`](vmm::UserMemory) behind another, and
//! always takes the address-space lock first.
//!
//! ## Hosted builds
//!
//! With the `hosted` feature, [`hosted::HostRam`] provides a page-aligned
//! heap buffer to act as physical memory and [`hosted::SoftMmu`] replaces
//! CR3 and `invlpg`. Everything above the [`PhysMapper`](kernel_vmem::PhysMapper)
//! and [`Mmu`](kernel_vmem::Mmu) seams runs unchanged.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_info::boot::{BootInfo, MemoryRegion, MemoryRegionKind};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let map = [MemoryRegion::new(
//!     PhysicalAddress::new(0),
//!     16 * 4096,
//!     MemoryRegionKind::Usable,
//! )];
//! let boot = BootInfo {
//!     memory_map: &map,
//!     direct_map_offset: 0xffff_8880_0000_0000,
//!     kernel_image: None,
//! };
//! let mut frames = BitmapFrameAlloc::new(&boot);
//! // Frame 0 is never handed out.
//! assert_eq!(frames.free_frames(), 15);
//! let frame = frames.allocate_frame().unwrap();
//! assert!(frames.free_frame(frame).unwrap());
//! ```

#![cfg_attr(not(any(test, doctest, feature = "hosted")), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod fault;
pub mod frame_alloc;
#[cfg(any(test, feature = "hosted"))]
pub mod hosted;
pub mod phys_mapper;
pub mod vmm;

pub use crate::fault::{FaultAccess, FaultError, FaultResolution, PageFaultError};
pub use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use crate::phys_mapper::DirectMapMapper;
pub use crate::vmm::{UserMemory, VmmError};

#[cfg(test)]
mod testing {
    use crate::frame_alloc::BitmapFrameAlloc;
    use crate::hosted::{HostRam, SoftMmu};
    use crate::phys_mapper::DirectMapMapper;
    use crate::vmm::UserMemory;
    use kernel_vmem::{PhysMapper, RootPage};

    /// Host RAM, a frame allocator over it and an empty kernel root.
    pub struct Machine {
        pub mapper: DirectMapMapper,
        pub frames: BitmapFrameAlloc,
        pub mmu: SoftMmu,
        pub kernel_root: RootPage,
        /// Free frames once the kernel root exists.
        pub baseline: u64,
        _ram: HostRam,
    }

    impl Machine {
        pub fn new(frames: u64) -> Self {
            let ram = HostRam::new(frames);
            let mapper = ram.mapper();
            let mut alloc = BitmapFrameAlloc::new(&ram.boot_info());
            let kernel_root = alloc.allocate_frame().unwrap();
            mapper.zero_frame(kernel_root);
            Self {
                mapper,
                baseline: alloc.free_frames(),
                frames: alloc,
                mmu: SoftMmu::new(kernel_root),
                kernel_root,
                _ram: ram,
            }
        }

        pub fn user_memory(&mut self) -> UserMemory {
            UserMemory::new(&self.mapper, &mut self.frames, self.kernel_root).unwrap()
        }
    }
}
