use crate::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress};
use core::fmt;

/// Virtual 4 KiB page base.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let page = VirtualPage::containing(VirtualAddress::new(0x40_1234));
/// assert_eq!(page.base().as_u64(), 0x40_1000);
/// assert_eq!(page.next().base().as_u64(), 0x40_2000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    /// The page containing `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(va.as_u64() & !(PAGE_SIZE - 1))
    }

    /// `Some` if `va` is page-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(va: VirtualAddress) -> Option<Self> {
        if va.is_page_aligned() {
            Some(Self(va.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + PAGE_SIZE)
    }

    /// Page number within the virtual address space (`base >> 12`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#018X})", self.0)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Iterator over the pages in `[start, end)`.
///
/// `start` is aligned down and `end` is treated as exclusive, so a range
/// covering a partial page yields that page.
#[derive(Clone, Debug)]
pub struct PageRange {
    next: u64,
    end: u64,
}

impl PageRange {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            next: start.as_u64() & !(PAGE_SIZE - 1),
            end: end.as_u64(),
        }
    }

    /// Number of pages left in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.next >= self.end {
            0
        } else {
            (self.end - self.next).div_ceil(PAGE_SIZE)
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for PageRange {
    type Item = VirtualPage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let page = VirtualPage(self.next);
        self.next = self.next.saturating_add(PAGE_SIZE);
        Some(page)
    }
}
