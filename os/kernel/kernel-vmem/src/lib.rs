//! # Virtual Memory Support
//!
//! x86-64 paging structures and the per-process address space model.
//!
//! ## What you get
//! - [`PageEntryBits`] / [`PageTableEntry`]: a typed view of a 64-bit
//!   page-table entry.
//! - [`PageTable`] plus [`TableIndex`]/[`TableLevel`] to address its 512 slots.
//! - [`AddressSpace`]: a PML4-rooted tree with map/unmap, copy-on-write
//!   fork and destruction.
//! - [`vma`]: the sorted, non-overlapping list of virtual memory areas that
//!   describes what *may* be mapped in a user address space.
//! - The seams to the rest of the kernel: [`FrameAlloc`] (frames and their
//!   reference counts), [`PhysMapper`] (reaching frames through the direct
//!   map) and [`Mmu`] (the local core's translation hardware).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   maps one 4 KiB page (leaf)
//!   │        │        └────────────► PDE   points to a PT
//!   │        └─────────────────────► PDPTE points to a PD
//!   └──────────────────────────────► PML4E points to a PDPT
//! ```
//!
//! Only 4 KiB leaves are used. Every level is allocated from the frame
//! allocator and owned by exactly one address space, with one exception:
//! the PDPTs behind PML4 slots 256..512 (the kernel half) are built once in
//! the kernel root and *referenced* from every user root.
//!
//! ## Copy-on-write
//!
//! [`AddressSpace::fork`] duplicates the user-half table structure but not
//! the data. Each private leaf becomes read-only in both spaces and its
//! frame gains a reference. The first write from either side faults, and the
//! fault resolver (in `kernel-alloc`) either copies the frame or, if the
//! writer turns out to be the sole owner, flips the entry back to writable.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
mod page_entry_bits;
mod page_table;
pub mod vma;

pub use crate::address_space::{AddressSpace, ForkError, MapError, RootPage};
pub use crate::page_entry_bits::{PageEntryBits, PageFlags};
pub use crate::page_table::{PageTable, PageTableEntry, TableIndex, TableLevel};
pub use crate::vma::{Vma, VmaError, VmaFlags, VmaKind, VmaList};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};

/// Source of physical frames and owner of their reference counts.
///
/// A frame returned by [`alloc_4k`](Self::alloc_4k) starts with one
/// reference. Every additional leaf entry that points at the frame must be
/// accounted for with [`share`](Self::share), and every entry that goes away
/// with [`release`](Self::release).
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame; contents are unspecified.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;

    /// Add one reference to an allocated frame.
    fn share(&mut self, page: PhysicalPage);

    /// Drop one reference. Returns `true` if the frame went back to the free pool.
    fn release(&mut self, page: PhysicalPage) -> bool;

    /// Current number of references (0 = free).
    fn ref_count(&self, page: PhysicalPage) -> u32;
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space, typically through the direct map.
///
/// # Safety
/// - Implementations must return pointers that stay valid (and writable)
///   for as long as the frame is allocated.
/// - Callers must not create aliasing `&mut` references to the same frame.
pub trait PhysMapper {
    /// Where `pa` is visible to the kernel.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Borrow the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be suitably aligned for `T` and the bytes must be a valid `T`.
    /// - No other reference to the same memory may be live for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }

    /// Borrow a whole frame as bytes.
    ///
    /// # Safety
    /// Same as [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    unsafe fn frame_bytes<'a>(&self, page: PhysicalPage) -> &'a mut [u8; PAGE_SIZE as usize] {
        unsafe { self.phys_to_mut(page.base()) }
    }

    /// Fill a frame with zeros.
    #[inline]
    fn zero_frame(&self, page: PhysicalPage) {
        let ptr = self.phys_to_virt(page.base()).as_mut_ptr::<u8>();
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
    }

    /// Copy the contents of `src` into `dst`. The frames must differ.
    #[inline]
    fn copy_frame(&self, src: PhysicalPage, dst: PhysicalPage) {
        debug_assert_ne!(src, dst);
        let from = self.phys_to_virt(src.base()).as_mut_ptr::<u8>();
        let to = self.phys_to_virt(dst.base()).as_mut_ptr::<u8>();
        unsafe { core::ptr::copy_nonoverlapping(from.cast_const(), to, PAGE_SIZE as usize) };
    }
}

/// The local core's address translation hardware.
///
/// Every method acts on the **calling** core only; there is no cross-core
/// shootdown.
pub trait Mmu {
    /// Discard any cached translation for `page` (`invlpg`).
    fn invalidate_page(&self, page: VirtualPage);

    /// Discard all non-global cached translations (CR3 reload).
    fn flush_all(&self);

    /// Make `root` the active PML4 (write CR3).
    fn activate(&self, root: PhysicalPage);

    /// The currently active PML4 (read CR3).
    fn active_root(&self) -> PhysicalPage;
}
