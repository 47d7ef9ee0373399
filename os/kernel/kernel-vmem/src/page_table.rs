//! # Page Tables
//!
//! A [`PageTable`] is one 4 KiB frame holding 512 [`PageTableEntry`] slots.
//! Slots are addressed with a [`TableIndex`], which can only be built from a
//! value below 512 or by extracting the 9-bit field of a virtual address for
//! a given [`TableLevel`].

use crate::PageFlags;
use crate::page_entry_bits::PageEntryBits;
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Number of entries in every table level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One of the four translation levels, top-down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl TableLevel {
    /// Bit position of this level's index field in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level below, or `None` for the PT.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

/// Validated index into a [`PageTable`] (`0..512`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// First PML4 slot of the kernel half.
    pub const KERNEL_HALF_START: Self = Self(256);

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(i: usize) -> Option<Self> {
        if i < ENTRIES_PER_TABLE {
            Some(Self(i as u16))
        } else {
            None
        }
    }

    /// The index `va` selects at `level`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress, level: TableLevel) -> Self {
        Self(((va.as_u64() >> level.shift()) & 0x1ff) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Contribution of this index to a virtual address at `level`.
    ///
    /// Only valid for lower-half addresses (no sign extension).
    #[inline]
    #[must_use]
    pub const fn address_bits(self, level: TableLevel) -> u64 {
        (self.0 as u64) << level.shift()
    }

    /// Every index of a table.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE as u16).map(Self)
    }

    /// PML4 slots covering the user half.
    pub fn user_half() -> impl Iterator<Item = Self> {
        (0..Self::KERNEL_HALF_START.0).map(Self)
    }

    /// PML4 slots covering the kernel half.
    pub fn kernel_half() -> impl Iterator<Item = Self> {
        (Self::KERNEL_HALF_START.0..ENTRIES_PER_TABLE as u16).map(Self)
    }
}

/// A typed page table entry.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct PageTableEntry(PageEntryBits);

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// A leaf mapping `page` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(page: PhysicalPage, flags: PageFlags) -> Self {
        Self(PageEntryBits::leaf(page, flags))
    }

    /// A pointer to the next-level table in `page`.
    #[inline]
    #[must_use]
    pub const fn table(page: PhysicalPage, user: bool) -> Self {
        Self(PageEntryBits::table(page, user))
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0.writable()
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0.user_access()
    }

    /// The frame this entry points to (table or data).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        self.0.frame()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        self.0.flags()
    }

    #[inline]
    #[must_use]
    pub const fn with_writable(self, writable: bool) -> Self {
        Self(self.0.with_writable(writable))
    }

    /// Same flags, different frame.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, page: PhysicalPage) -> Self {
        let mut bits = self.0;
        bits.set_physical_address(page.base());
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u64) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return f.write_str("PageTableEntry(<not present>)");
        }
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A 4 KiB-aligned array of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Indices and entries of every present slot.
    pub fn present(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.is_present())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_of_user_address() {
        let va = VirtualAddress::new(0x0000_7FFF_FFFF_F000);
        assert_eq!(TableIndex::of(va, TableLevel::Pml4).as_usize(), 255);
        assert_eq!(TableIndex::of(va, TableLevel::Pdpt).as_usize(), 511);
        assert_eq!(TableIndex::of(va, TableLevel::Pd).as_usize(), 511);
        assert_eq!(TableIndex::of(va, TableLevel::Pt).as_usize(), 511);

        let rebuilt = [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd, TableLevel::Pt]
            .into_iter()
            .map(|l| TableIndex::of(va, l).address_bits(l))
            .sum::<u64>();
        assert_eq!(rebuilt, va.as_u64());
    }

    #[test]
    fn index_bounds() {
        assert!(TableIndex::new(511).is_some());
        assert!(TableIndex::new(512).is_none());
        assert_eq!(TableIndex::user_half().count(), 256);
        assert_eq!(TableIndex::kernel_half().count(), 256);
    }

    #[test]
    fn leaf_roundtrip_keeps_frame_and_flags() {
        let page = PhysicalPage::containing(kernel_memory_addresses::PhysicalAddress::new(0x7000));
        let e = PageTableEntry::leaf(page, PageFlags::USER_DATA);
        assert!(e.is_present() && e.is_writable() && e.is_user());
        assert_eq!(e.frame(), page);
        let ro = e.with_writable(false);
        assert!(!ro.is_writable());
        assert_eq!(ro.frame(), page);
        assert_eq!(PageTableEntry::from_raw(ro.raw()).flags(), ro.flags());
    }
}
