//! # Address Space (x86-64, PML4-rooted)
//!
//! Handle to a single page-table tree and the operations the scheduler and
//! memory core need on it.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new_kernel`] builds the process-wide kernel root: the
//!   direct map of all physical memory plus the kernel image.
//! - [`AddressSpace::new_user`] creates a root that shares the kernel half
//!   by reference and leaves the user half empty.
//! - [`AddressSpace::map`] / [`AddressSpace::unmap`] install and clear 4 KiB
//!   leaves, allocating intermediate tables on the way down.
//! - [`AddressSpace::fork`] clones the user half copy-on-write.
//! - [`AddressSpace::destroy`] releases every user-half frame and table.
//!
//! ## Design
//!
//! - Intermediate tables are reached only through [`TableIndex`] and the
//!   [`walk`](AddressSpace::walk) / `walk_or_create` pair; nothing else
//!   follows raw entry pointers.
//! - The handle borrows a [`PhysMapper`] and does not own the root. Dropping
//!   it leaks nothing; freeing the tree is an explicit
//!   [`destroy`](AddressSpace::destroy).
//! - Mutating a mapping invalidates the page on the **local** core through
//!   [`Mmu`]. Cores running other threads of the same process are not shot
//!   down.

mod fork;
mod kernel_root;

use crate::page_table::{PageTable, PageTableEntry, TableIndex, TableLevel};
use crate::{FrameAlloc, Mmu, PageFlags, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use log::trace;

pub use fork::ForkError;

/// The PML4 root page for an [`AddressSpace`].
pub type RootPage = PhysicalPage;

/// Reasons a mapping could not be installed.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    /// A table of the given level could not be allocated.
    #[error("out of memory allocating a {0:?} table")]
    OutOfMemory(TableLevel),
    /// The leaf is already present; unmap it first.
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    /// The address is neither in the user nor in the kernel half.
    #[error("{0} is not canonical")]
    NonCanonical(VirtualAddress),
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// If you already know the root frame, use the explicit constructor.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// View the address space that is active on the calling core.
    #[inline]
    pub fn from_active(mapper: &'m M, mmu: &impl Mmu) -> Self {
        Self::from_root(mapper, mmu.active_root())
    }

    /// Create a fresh user address space.
    ///
    /// The kernel half (PML4 slots 256..512) is copied **by reference** from
    /// `kernel_root`: the child shares the same PDPTs, so kernel mappings
    /// added below those slots later are visible everywhere.
    pub fn new_user<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        kernel_root: RootPage,
    ) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(TableLevel::Pml4))?;
        mapper.zero_frame(root);

        let space = Self::from_root(mapper, root);
        let kernel = space.table_mut(kernel_root);
        let pml4 = space.table_mut(root);
        for i in TableIndex::kernel_half() {
            pml4.set(i, kernel.get(i));
        }

        trace!("created user root {root:?}");
        Ok(space)
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Load this space into the local core.
    #[inline]
    pub fn activate(&self, mmu: &impl Mmu) {
        mmu.activate(self.root);
    }

    #[inline]
    pub fn is_active(&self, mmu: &impl Mmu) -> bool {
        mmu.active_root() == self.root
    }

    /// Borrow the table stored in `page`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn table_mut(&self, page: PhysicalPage) -> &'m mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Allocate and zero a table frame.
    pub(crate) fn alloc_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        level: TableLevel,
    ) -> Result<PhysicalPage, MapError> {
        let page = alloc.alloc_4k().ok_or(MapError::OutOfMemory(level))?;
        self.mapper.zero_frame(page);
        Ok(page)
    }

    /// Walk to the PT covering `va` without allocating.
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalPage> {
        let mut table = self.root;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let e = self.table_mut(table).get(TableIndex::of(va, level));
            if !e.is_present() {
                return None;
            }
            table = e.frame();
        }
        Some(table)
    }

    /// Walk to the PT covering `va`, allocating missing levels.
    fn walk_or_create<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage, MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical(va));
        }

        let user = va.is_user();
        let mut table = self.root;
        let mut level = TableLevel::Pml4;
        while let Some(child_level) = level.next() {
            let t = self.table_mut(table);
            let i = TableIndex::of(va, level);
            let e = t.get(i);
            table = if e.is_present() {
                e.frame()
            } else {
                let child = self.alloc_table(alloc, child_level)?;
                t.set(i, PageTableEntry::table(child, user));
                child
            };
            level = child_level;
        }
        Ok(table)
    }

    /// Install a 4 KiB leaf `page -> frame`.
    ///
    /// The frame's reference is **transferred** to the mapping; the caller
    /// does not `share` it.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if an intermediate table can't be allocated.
    ///   Tables created before the failure stay linked and are reclaimed by
    ///   [`destroy`](Self::destroy).
    /// - [`MapError::AlreadyMapped`] if a present leaf exists.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let va = page.base();
        let pt = self.table_mut(self.walk_or_create(alloc, va)?);
        let i = TableIndex::of(va, TableLevel::Pt);
        if pt.get(i).is_present() {
            return Err(MapError::AlreadyMapped(va));
        }
        pt.set(i, PageTableEntry::leaf(frame, flags));
        Ok(())
    }

    /// Clear the leaf for `page` and invalidate it on the local core.
    ///
    /// Returns the frame that was mapped. The caller owns that reference and
    /// must release it.
    pub fn unmap(&self, page: VirtualPage, mmu: &impl Mmu) -> Option<PhysicalPage> {
        let va = page.base();
        let pt = self.table_mut(self.walk(va)?);
        let i = TableIndex::of(va, TableLevel::Pt);
        let e = pt.get(i);
        if !e.is_present() {
            return None;
        }
        pt.set(i, PageTableEntry::zero());
        mmu.invalidate_page(page);
        Some(e.frame())
    }

    /// The raw leaf entry for `va`, present or not.
    ///
    /// `None` if no PT covers the address yet.
    pub fn entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let pt = self.table_mut(self.walk(va)?);
        Some(pt.get(TableIndex::of(va, TableLevel::Pt)))
    }

    /// Translate `va` to a physical address if a present leaf maps it.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let e = self.entry(va)?;
        e.is_present()
            .then(|| e.frame().base() + va.offset_in_page())
    }

    /// Rewrite the present leaf for `page` with `f` and invalidate it.
    ///
    /// Returns the previous entry, or `None` if nothing is mapped.
    pub fn update(
        &self,
        page: VirtualPage,
        mmu: &impl Mmu,
        f: impl FnOnce(PageTableEntry) -> PageTableEntry,
    ) -> Option<PageTableEntry> {
        let va = page.base();
        let pt = self.table_mut(self.walk(va)?);
        let i = TableIndex::of(va, TableLevel::Pt);
        let old = pt.get(i);
        if !old.is_present() {
            return None;
        }
        pt.set(i, f(old));
        mmu.invalidate_page(page);
        Some(old)
    }

    /// Visit every present user-half leaf in ascending address order.
    pub fn for_each_user_leaf(&self, mut f: impl FnMut(VirtualPage, PageTableEntry)) {
        let pml4 = self.table_mut(self.root);
        for (i4, e4) in TableIndex::user_half().map(|i| (i, pml4.get(i))) {
            if !e4.is_present() {
                continue;
            }
            for (i3, e3) in self.table_mut(e4.frame()).present() {
                for (i2, e2) in self.table_mut(e3.frame()).present() {
                    for (i1, e1) in self.table_mut(e2.frame()).present() {
                        let va = i4.address_bits(TableLevel::Pml4)
                            | i3.address_bits(TableLevel::Pdpt)
                            | i2.address_bits(TableLevel::Pd)
                            | i1.address_bits(TableLevel::Pt);
                        f(VirtualPage::containing(VirtualAddress::new(va)), e1);
                    }
                }
            }
        }
    }

    /// Number of present user-half leaves.
    pub fn resident_pages(&self) -> usize {
        let mut n = 0;
        self.for_each_user_leaf(|_, _| n += 1);
        n
    }

    /// Release every user-half leaf frame and table, then the root itself.
    ///
    /// The kernel half is shared with every other root and is left alone.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let pml4 = self.table_mut(self.root);
        for i in TableIndex::user_half() {
            let e = pml4.get(i);
            if e.is_present() {
                self.release_level(alloc, e.frame(), TableLevel::Pdpt);
                pml4.set(i, PageTableEntry::zero());
            }
        }
        alloc.release(self.root);
        trace!("destroyed address space {:?}", self.root);
    }

    fn release_level<A: FrameAlloc>(&self, alloc: &mut A, table: PhysicalPage, level: TableLevel) {
        let t = self.table_mut(table);
        for (_, e) in t.present() {
            match level.next() {
                Some(next) => self.release_level(alloc, e.frame(), next),
                None => {
                    alloc.release(e.frame());
                }
            }
        }
        alloc.release(table);
    }
}
