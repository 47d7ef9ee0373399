//! # Virtual Memory Areas
//!
//! A [`VmaList`] records which ranges of a user address space *may* be
//! mapped and with which permissions. The page tables record what *is*
//! mapped; every present user-half leaf lies inside exactly one area.
//!
//! Areas are kept sorted by start address and never overlap. Lookups are a
//! binary search.

use crate::PageFlags;
use alloc::vec::Vec;
use kernel_info::memory::MMAP_BASE;
use kernel_memory_addresses::{PAGE_SIZE, USER_HALF_END, VirtualAddress, checked_align_up};

bitflags::bitflags! {
    /// Permissions and sharing of an area.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        /// Writes are visible to every space mapping the area; fork shares
        /// the frames writable instead of copy-on-write.
        const SHARED = 1 << 4;
    }
}

impl VmaFlags {
    /// Ordinary private user data.
    pub const USER_RW: Self = Self::READ.union(Self::WRITE).union(Self::USER);

    /// Leaf permissions for pages of an area with these flags.
    #[must_use]
    pub const fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.contains(Self::WRITE) {
            flags = flags.union(PageFlags::WRITABLE);
        }
        if self.contains(Self::USER) {
            flags = flags.union(PageFlags::USER);
        }
        if !self.contains(Self::EXEC) {
            flags = flags.union(PageFlags::NO_EXECUTE);
        }
        flags
    }
}

/// What backs the pages of an area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmaKind {
    /// Zero-filled on first touch.
    Anonymous,
    /// Initialized from a file; `offset` is the file position of `start`.
    File { offset: u64 },
}

/// One area `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Vma {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmaFlags,
    pub kind: VmaKind,
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum VmaError {
    #[error("{0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("empty area")]
    Empty,
    #[error("{start}..{end} overlaps an existing area")]
    Overlap {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("no free range of {0:#x} bytes")]
    NoSpace(u64),
    #[error("area leaves the user half")]
    OutsideUserSpace,
}

impl Vma {
    /// # Errors
    /// The bounds must be page aligned, non-empty and inside the user half.
    pub const fn new(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> Result<Self, VmaError> {
        if !start.is_page_aligned() {
            return Err(VmaError::Unaligned(start));
        }
        if !end.is_page_aligned() {
            return Err(VmaError::Unaligned(end));
        }
        if end.as_u64() <= start.as_u64() {
            return Err(VmaError::Empty);
        }
        if end.as_u64() > USER_HALF_END {
            return Err(VmaError::OutsideUserSpace);
        }
        Ok(Self {
            start,
            end,
            flags,
            kind,
        })
    }

    /// An anonymous area.
    ///
    /// # Errors
    /// See [`Vma::new`].
    pub const fn anonymous(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmaFlags,
    ) -> Result<Self, VmaError> {
        Self::new(start, end, flags, VmaKind::Anonymous)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u64() <= va.as_u64() && va.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start.as_u64() < end.as_u64() && start.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.flags.contains(VmaFlags::WRITE)
    }

    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.flags.contains(VmaFlags::SHARED)
    }

    /// The sub-area `[start, end)`, with the file offset moved along.
    fn slice(&self, start: VirtualAddress, end: VirtualAddress) -> Self {
        let kind = match self.kind {
            VmaKind::Anonymous => VmaKind::Anonymous,
            VmaKind::File { offset } => VmaKind::File {
                offset: offset + (start.as_u64() - self.start.as_u64()),
            },
        };
        Self {
            start,
            end,
            flags: self.flags,
            kind,
        }
    }
}

/// Sorted, non-overlapping areas of one address space plus its heap and
/// `mmap` cursors.
#[derive(Clone, Debug)]
pub struct VmaList {
    areas: Vec<Vma>,
    start_brk: VirtualAddress,
    brk: VirtualAddress,
    mmap_base: VirtualAddress,
}

impl Default for VmaList {
    fn default() -> Self {
        Self::new()
    }
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            areas: Vec::new(),
            start_brk: VirtualAddress::zero(),
            brk: VirtualAddress::zero(),
            mmap_base: VirtualAddress::new(MMAP_BASE),
        }
    }

    /// Insert `vma`, keeping the list sorted.
    ///
    /// # Errors
    /// [`VmaError::Overlap`] if any existing area intersects it.
    pub fn insert(&mut self, vma: Vma) -> Result<(), VmaError> {
        let at = self.areas.partition_point(|a| a.start < vma.start);
        let clashes_prev = at > 0 && self.areas[at - 1].end > vma.start;
        let clashes_next = self.areas.get(at).is_some_and(|n| n.start < vma.end);
        if clashes_prev || clashes_next {
            return Err(VmaError::Overlap {
                start: vma.start,
                end: vma.end,
            });
        }
        self.areas.insert(at, vma);
        Ok(())
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Vma> {
        let at = self.areas.partition_point(|a| a.end <= va);
        self.areas.get(at).filter(|a| a.contains(va))
    }

    /// Whether `va` lies in a [`VmaFlags::SHARED`] area.
    #[must_use]
    pub fn is_shared(&self, va: VirtualAddress) -> bool {
        self.find(va).is_some_and(Vma::is_shared)
    }

    /// Remove `[start, end)` from every area it touches.
    ///
    /// Areas straddling a boundary are split; the parts outside the range
    /// stay. Returns the removed pieces in ascending order so the caller can
    /// unmap exactly what was covered.
    pub fn remove(&mut self, start: VirtualAddress, end: VirtualAddress) -> Vec<Vma> {
        let mut removed = Vec::new();
        if end <= start {
            return removed;
        }

        let first = self.areas.partition_point(|a| a.end <= start);
        let last = self.areas.partition_point(|a| a.start < end);
        if first >= last {
            return removed;
        }

        let mut kept = Vec::new();
        for a in self.areas.drain(first..last) {
            if a.start < start {
                kept.push(a.slice(a.start, start));
            }
            removed.push(a.slice(a.start.max(start), a.end.min(end)));
            if a.end > end {
                kept.push(a.slice(end, a.end));
            }
        }
        self.areas.splice(first..first, kept);
        removed
    }

    /// Grow or shrink the area starting at `start` so it ends at `new_end`.
    ///
    /// # Errors
    /// - [`VmaError::Empty`] if `new_end` is not above `start` or no area starts there.
    /// - [`VmaError::Overlap`] if growing would run into the next area.
    pub fn resize(&mut self, start: VirtualAddress, new_end: VirtualAddress) -> Result<(), VmaError> {
        if !new_end.is_page_aligned() {
            return Err(VmaError::Unaligned(new_end));
        }
        if new_end <= start {
            return Err(VmaError::Empty);
        }
        let at = self
            .areas
            .binary_search_by(|a| a.start.cmp(&start))
            .map_err(|_| VmaError::Empty)?;
        if let Some(next) = self.areas.get(at + 1)
            && next.start < new_end
        {
            return Err(VmaError::Overlap {
                start,
                end: new_end,
            });
        }
        self.areas[at].end = new_end;
        Ok(())
    }

    /// Highest free range of `size` bytes (rounded to pages) below the
    /// `mmap` base.
    ///
    /// The search walks the gaps between areas downward and never returns
    /// page 0.
    ///
    /// # Errors
    /// [`VmaError::NoSpace`] if no gap is large enough.
    pub fn find_free(&self, size: u64) -> Result<VirtualAddress, VmaError> {
        let size = checked_align_up(size, PAGE_SIZE)
            .filter(|&s| s > 0)
            .ok_or(VmaError::NoSpace(size))?;

        let mut top = self.mmap_base.as_u64();
        for a in self.areas.iter().rev() {
            if a.start.as_u64() >= top {
                continue;
            }
            if a.end.as_u64() <= top && top - a.end.as_u64() >= size {
                return Ok(VirtualAddress::new(top - size));
            }
            top = a.start.as_u64();
        }

        top.checked_sub(size)
            .filter(|&start| start >= PAGE_SIZE)
            .map(VirtualAddress::new)
            .ok_or(VmaError::NoSpace(size))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> + '_ {
        self.areas.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Drop every area; the cursors are reset as well.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    #[must_use]
    pub const fn start_brk(&self) -> VirtualAddress {
        self.start_brk
    }

    #[must_use]
    pub const fn brk(&self) -> VirtualAddress {
        self.brk
    }

    /// Place the heap; both cursors start at `at`.
    pub const fn set_heap_start(&mut self, at: VirtualAddress) {
        self.start_brk = at;
        self.brk = at;
    }

    pub const fn set_brk(&mut self, brk: VirtualAddress) {
        self.brk = brk;
    }

    #[must_use]
    pub const fn mmap_base(&self) -> VirtualAddress {
        self.mmap_base
    }
}
