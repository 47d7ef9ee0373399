//! # Hosted RAM
//!
//! A page-aligned heap buffer that plays the role of physical memory when the
//! core runs as an ordinary process. Physical address `pa` is byte `pa` of
//! the buffer, so frame `n` is the `n`-th 4 KiB block.
//!
//! [`SoftMmu`] stands in for the core's translation hardware and records
//! what it was asked to do.

extern crate std;

use crate::phys_mapper::DirectMapMapper;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_info::boot::{BootInfo, MemoryRegion, MemoryRegionKind};
use kernel_info::memory::DIRECT_MAP_BASE;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualPage};
use kernel_vmem::Mmu;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::sync::Mutex;
use std::vec::Vec;

/// `frames` frames of zeroed host memory.
pub struct HostRam {
    base: NonNull<u8>,
    layout: Layout,
    map: [MemoryRegion; 1],
}

// The buffer is plain memory; access is coordinated by the frame allocator
// and the per-address-space locks, exactly as with real RAM.
unsafe impl Send for HostRam {}
unsafe impl Sync for HostRam {}

impl HostRam {
    /// # Panics
    /// If the host is out of memory or `frames` is zero.
    #[must_use]
    pub fn new(frames: u64) -> Self {
        assert!(frames > 0, "hosted RAM needs at least one frame");
        let bytes = usize::try_from(frames * PAGE_SIZE).expect("hosted RAM too large");
        let layout =
            Layout::from_size_align(bytes, PAGE_SIZE as usize).expect("hosted RAM layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self {
            base,
            layout,
            map: [MemoryRegion::new(
                PhysicalAddress::zero(),
                frames * PAGE_SIZE,
                MemoryRegionKind::Usable,
            )],
        }
    }

    /// A mapper that resolves physical addresses into the buffer.
    #[must_use]
    pub fn mapper(&self) -> DirectMapMapper {
        DirectMapMapper::new(self.base.as_ptr() as u64)
    }

    /// Boot handoff describing the buffer as one usable region.
    ///
    /// The kernel root still places its direct map at [`DIRECT_MAP_BASE`];
    /// only [`mapper`](Self::mapper) knows where the bytes really are.
    #[must_use]
    pub fn boot_info(&self) -> BootInfo<'_> {
        BootInfo {
            memory_map: &self.map,
            direct_map_offset: DIRECT_MAP_BASE,
            kernel_image: None,
        }
    }

    /// Size in frames.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.layout.size() as u64 / PAGE_SIZE
    }
}

impl Drop for HostRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Software MMU: remembers the active root and every invalidation.
#[derive(Debug, Default)]
pub struct SoftMmu {
    root: AtomicU64,
    invalidated: Mutex<Vec<VirtualPage>>,
    flushes: AtomicUsize,
}

impl SoftMmu {
    #[must_use]
    pub fn new(root: PhysicalPage) -> Self {
        Self {
            root: AtomicU64::new(root.base().as_u64()),
            ..Self::default()
        }
    }

    /// Pages invalidated so far, oldest first.
    #[must_use]
    pub fn invalidated(&self) -> Vec<VirtualPage> {
        self.invalidated
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Mmu for SoftMmu {
    fn invalidate_page(&self, page: VirtualPage) {
        if let Ok(mut log) = self.invalidated.lock() {
            log.push(page);
        }
    }

    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn activate(&self, root: PhysicalPage) {
        self.root.store(root.base().as_u64(), Ordering::Release);
        self.flush_all();
    }

    fn active_root(&self) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(self.root.load(Ordering::Acquire)))
    }
}
