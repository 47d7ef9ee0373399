use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// Index of a 4 KiB physical frame.
///
/// Frame `n` covers the physical bytes `n * 4096 .. (n + 1) * 4096`. The
/// frame allocator indexes its occupancy bitmap and reference counts by this
/// number.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame number as an index into allocator bookkeeping arrays.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage::from_frame(self)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Physical 4 KiB frame base.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::containing(PhysicalAddress::new(0x5123));
/// assert_eq!(frame.base().as_u64(), 0x5000);
/// assert_eq!(frame.frame().as_u64(), 5);
/// assert_eq!(PhysicalPage::from_aligned(PhysicalAddress::new(0x5123)), None);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// The frame containing `pa` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() & !(PAGE_SIZE - 1))
    }

    /// `Some` if `pa` is frame-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(pa: PhysicalAddress) -> Option<Self> {
        if pa.offset_in_page() == 0 {
            Some(Self(pa.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_frame(n: FrameNumber) -> Self {
        Self(n.as_u64() << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    /// The frame `n` frames above this one.
    #[inline]
    #[must_use]
    pub const fn add_frames(self, n: u64) -> Self {
        Self(self.0 + (n << PAGE_SHIFT))
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#018X})", self.0)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<FrameNumber> for PhysicalPage {
    #[inline]
    fn from(n: FrameNumber) -> Self {
        Self::from_frame(n)
    }
}
