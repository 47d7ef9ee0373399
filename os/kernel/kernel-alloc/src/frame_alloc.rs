//! # Physical Frame Allocator
//!
//! One bit per frame records occupancy; a parallel array holds the number of
//! leaf entries referencing each allocated frame. Both are sized to the
//! highest frame backed by RAM in the boot memory map.
//!
//! ```text
//!  used:  | 1 | 1 | 0 | 1 | 0 | 0 | ...   (1 = allocated or never usable)
//!  refs:  | 0 | 1 | 0 | 2 | 0 | 0 | ...   (0 on a used frame = reserved)
//!            ^       ^
//!            |       `-- hint: scanning starts here and wraps to frame 1
//!            `---------- frame 0 is never handed out
//! ```
//!
//! A frame is free exactly when its reference count is zero and it lies in
//! a usable region.

use alloc::vec;
use alloc::vec::Vec;
use kernel_info::boot::{BootInfo, MemoryRegionKind};
use kernel_memory_addresses::{
    FrameNumber, PAGE_SHIFT, PAGE_SIZE, PhysicalPage, align_down, checked_align_up,
};
use kernel_vmem::FrameAlloc;
use log::{debug, info, warn};

const BITS: u64 = u64::BITS as u64;

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("{0} is beyond the end of physical memory")]
    OutOfRange(PhysicalPage),
    #[error("{0} is not allocated")]
    NotAllocated(PhysicalPage),
    #[error("{0} is reserved")]
    Reserved(PhysicalPage),
    #[error("reference count of {0} overflows")]
    RefCountOverflow(PhysicalPage),
}

/// Bitmap allocator with per-frame reference counts.
pub struct BitmapFrameAlloc {
    used: Vec<u64>,
    refs: Vec<u32>,
    limit: u64,
    hint: u64,
    free: u64,
}

impl BitmapFrameAlloc {
    /// Build the allocator from the boot memory map.
    ///
    /// Only whole frames inside [`MemoryRegionKind::Usable`] regions become
    /// allocatable. Frames touched by any other region stay reserved even if a
    /// usable region overlaps them, and frame 0 is always reserved.
    #[must_use]
    pub fn new(boot: &BootInfo<'_>) -> Self {
        let limit = boot.frame_limit().as_u64();
        let words = usize::try_from(limit.div_ceil(BITS)).unwrap_or(usize::MAX);
        let mut this = Self {
            used: vec![u64::MAX; words],
            refs: vec![0; usize::try_from(limit).unwrap_or(usize::MAX)],
            limit,
            hint: 1,
            free: 0,
        };

        for region in boot
            .memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
        {
            let first = checked_align_up(region.base.as_u64(), PAGE_SIZE)
                .map_or(limit, |a| a >> PAGE_SHIFT);
            let last = (region.end().as_u64() >> PAGE_SHIFT).min(limit);
            for f in first..last {
                this.set_free(f);
            }
        }

        for region in boot
            .memory_map
            .iter()
            .filter(|r| r.kind != MemoryRegionKind::Usable)
        {
            let first = align_down(region.base.as_u64(), PAGE_SIZE) >> PAGE_SHIFT;
            let last = checked_align_up(region.end().as_u64(), PAGE_SIZE)
                .map_or(limit, |a| a >> PAGE_SHIFT)
                .min(limit);
            for f in first..last {
                this.set_used(f);
            }
        }

        if limit > 0 {
            this.set_used(0);
        }

        info!(
            "frame allocator: {} of {} frames free ({} KiB)",
            this.free,
            this.limit,
            this.free * PAGE_SIZE / 1024
        );
        this
    }

    /// Number of frames tracked (one past the highest frame number).
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.limit
    }

    /// Number of frames currently available.
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free
    }

    /// Allocate one frame with a reference count of 1.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if every frame is in use.
    pub fn allocate_frame(&mut self) -> Result<PhysicalPage, FrameAllocError> {
        if self.free == 0 {
            return Err(FrameAllocError::OutOfMemory);
        }
        let f = self
            .first_free_from(self.hint)
            .or_else(|| self.first_free_from(1))
            .ok_or(FrameAllocError::OutOfMemory)?;
        self.take(f);
        self.hint = if f + 1 < self.limit { f + 1 } else { 1 };
        Ok(Self::page(f))
    }

    /// Allocate `n` physically contiguous frames, each with a reference
    /// count of 1. Returns the first.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no run of `n` free frames exists
    /// or `n` is zero.
    pub fn allocate_contiguous(&mut self, n: u64) -> Result<PhysicalPage, FrameAllocError> {
        if n == 0 || n > self.free {
            return Err(FrameAllocError::OutOfMemory);
        }

        let mut start = 1;
        let mut run = 0;
        let mut f = 1;
        while f < self.limit {
            if self.is_used(f) {
                run = 0;
                f += 1;
                continue;
            }
            if run == 0 {
                start = f;
            }
            run += 1;
            if run == n {
                for g in start..start + n {
                    self.take(g);
                }
                debug!("allocated {n} contiguous frames at {}", Self::page(start));
                return Ok(Self::page(start));
            }
            f += 1;
        }
        Err(FrameAllocError::OutOfMemory)
    }

    /// Drop the caller's reference; the frame returns to the pool at zero.
    ///
    /// Returns whether the frame was freed.
    ///
    /// # Errors
    /// See [`unref_frame`](Self::unref_frame).
    pub fn free_frame(&mut self, page: PhysicalPage) -> Result<bool, FrameAllocError> {
        self.unref_frame(page)
    }

    /// Release every frame of a run obtained from
    /// [`allocate_contiguous`](Self::allocate_contiguous).
    ///
    /// # Errors
    /// Stops at the first frame that is not allocated.
    pub fn free_contiguous(&mut self, first: PhysicalPage, n: u64) -> Result<(), FrameAllocError> {
        for i in 0..n {
            self.unref_frame(first.add_frames(i))?;
        }
        Ok(())
    }

    /// Add one reference. Returns the new count.
    ///
    /// # Errors
    /// - [`FrameAllocError::Reserved`] / [`FrameAllocError::NotAllocated`] for
    ///   frames that are not handed out.
    /// - [`FrameAllocError::RefCountOverflow`] at `u32::MAX`.
    pub fn ref_frame(&mut self, page: PhysicalPage) -> Result<u32, FrameAllocError> {
        let f = self.allocated_index(page)?;
        let count = &mut self.refs[f];
        *count = count
            .checked_add(1)
            .ok_or(FrameAllocError::RefCountOverflow(page))?;
        Ok(*count)
    }

    /// Drop one reference; the frame returns to the free pool at zero.
    ///
    /// Returns whether the frame was freed.
    ///
    /// # Errors
    /// [`FrameAllocError::Reserved`], [`FrameAllocError::OutOfRange`] or
    /// [`FrameAllocError::NotAllocated`] if the frame holds no reference.
    pub fn unref_frame(&mut self, page: PhysicalPage) -> Result<bool, FrameAllocError> {
        let f = self.allocated_index(page)?;
        self.refs[f] -= 1;
        if self.refs[f] > 0 {
            return Ok(false);
        }

        let n = page.frame().as_u64();
        self.set_free(n);
        self.hint = self.hint.min(n);
        Ok(true)
    }

    /// Current reference count; 0 for free and reserved frames.
    #[must_use]
    pub fn ref_count(&self, page: PhysicalPage) -> u32 {
        usize::try_from(page.frame().as_u64())
            .ok()
            .and_then(|i| self.refs.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// Index of an allocated frame, or why it isn't one.
    fn allocated_index(&self, page: PhysicalPage) -> Result<usize, FrameAllocError> {
        let n = page.frame().as_u64();
        if n >= self.limit {
            return Err(FrameAllocError::OutOfRange(page));
        }
        let i = Self::index(n);
        if self.refs[i] > 0 {
            Ok(i)
        } else if n == 0 || self.is_used(n) {
            Err(FrameAllocError::Reserved(page))
        } else {
            Err(FrameAllocError::NotAllocated(page))
        }
    }

    /// First clear bit at or after `start`.
    fn first_free_from(&self, start: u64) -> Option<u64> {
        if start >= self.limit {
            return None;
        }
        let mut w = Self::index(start / BITS);
        let mut word = self.used[w] | ((1u64 << (start % BITS)) - 1);
        loop {
            if word != u64::MAX {
                let f = w as u64 * BITS + u64::from((!word).trailing_zeros());
                return (f < self.limit).then_some(f);
            }
            w += 1;
            word = *self.used.get(w)?;
        }
    }

    fn take(&mut self, f: u64) {
        self.set_used(f);
        self.refs[Self::index(f)] = 1;
    }

    fn is_used(&self, f: u64) -> bool {
        self.used[Self::index(f / BITS)] & (1 << (f % BITS)) != 0
    }

    fn set_used(&mut self, f: u64) {
        if !self.is_used(f) {
            self.used[Self::index(f / BITS)] |= 1 << (f % BITS);
            self.free -= 1;
        }
    }

    fn set_free(&mut self, f: u64) {
        if self.is_used(f) {
            self.used[Self::index(f / BITS)] &= !(1 << (f % BITS));
            self.free += 1;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(n: u64) -> usize {
        n as usize
    }

    const fn page(f: u64) -> PhysicalPage {
        PhysicalPage::from_frame(FrameNumber::new(f))
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.allocate_frame().ok()
    }

    fn share(&mut self, page: PhysicalPage) {
        if let Err(e) = self.ref_frame(page) {
            warn!("share: {e}");
        }
    }

    fn release(&mut self, page: PhysicalPage) -> bool {
        self.unref_frame(page).unwrap_or_else(|e| {
            warn!("release: {e}");
            false
        })
    }

    fn ref_count(&self, page: PhysicalPage) -> u32 {
        Self::ref_count(self, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegion;
    use kernel_memory_addresses::PhysicalAddress;

    fn boot(map: &[MemoryRegion]) -> BootInfo<'_> {
        BootInfo {
            memory_map: map,
            direct_map_offset: kernel_info::memory::DIRECT_MAP_BASE,
            kernel_image: None,
        }
    }

    fn usable(base: u64, len: u64) -> MemoryRegion {
        MemoryRegion::new(PhysicalAddress::new(base), len, MemoryRegionKind::Usable)
    }

    fn frame(n: u64) -> PhysicalPage {
        PhysicalPage::from_frame(FrameNumber::new(n))
    }

    #[test]
    fn frame_zero_is_never_handed_out() {
        let map = [usable(0, 4 * PAGE_SIZE)];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        assert_eq!(frames.total_frames(), 4);
        assert_eq!(frames.free_frames(), 3);

        let got: Vec<_> = core::iter::from_fn(|| frames.allocate_frame().ok()).collect();
        assert_eq!(got, [frame(1), frame(2), frame(3)]);
        assert_eq!(frames.allocate_frame(), Err(FrameAllocError::OutOfMemory));
        assert_eq!(frames.free_frame(frame(0)), Err(FrameAllocError::Reserved(frame(0))));
    }

    #[test]
    fn reserved_ranges_win_over_usable_ones() {
        let map = [
            usable(0, 16 * PAGE_SIZE),
            MemoryRegion::new(
                PhysicalAddress::new(4 * PAGE_SIZE + 0x10),
                0x20,
                MemoryRegionKind::KernelImage,
            ),
            // A usable region that does not start on a frame boundary loses its partial frame.
            usable(16 * PAGE_SIZE + 0x800, 2 * PAGE_SIZE),
        ];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        assert_eq!(frames.total_frames(), 18);
        // 1..16 minus frame 4, plus frame 17.
        assert_eq!(frames.free_frames(), 15);
        assert_eq!(frames.ref_frame(frame(4)), Err(FrameAllocError::Reserved(frame(4))));
        assert_eq!(frames.ref_frame(frame(16)), Err(FrameAllocError::Reserved(frame(16))));

        let all: Vec<_> = core::iter::from_fn(|| frames.allocate_frame().ok()).collect();
        assert!(!all.contains(&frame(4)));
        assert!(!all.contains(&frame(16)));
        assert!(all.contains(&frame(17)));
    }

    #[test]
    fn reference_counts_gate_freeing() {
        let map = [usable(0, 8 * PAGE_SIZE)];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        let f = frames.allocate_frame().unwrap();
        assert_eq!(frames.ref_count(f), 1);
        assert_eq!(frames.ref_frame(f), Ok(2));

        let free = frames.free_frames();
        assert_eq!(frames.unref_frame(f), Ok(false));
        assert_eq!(frames.free_frames(), free);
        assert_eq!(frames.free_frame(f), Ok(true));
        assert_eq!(frames.free_frames(), free + 1);
        assert_eq!(frames.ref_count(f), 0);

        assert_eq!(frames.free_frame(f), Err(FrameAllocError::NotAllocated(f)));
        assert_eq!(frames.ref_frame(frame(99)), Err(FrameAllocError::OutOfRange(frame(99))));
    }

    #[test]
    fn scan_resumes_at_the_hint_and_wraps() {
        let map = [usable(0, 6 * PAGE_SIZE)];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();
        let c = frames.allocate_frame().unwrap();
        assert_eq!((a, b, c), (frame(1), frame(2), frame(3)));

        // Freeing lowers the hint, so the hole is reused first.
        frames.free_frame(b).unwrap();
        assert_eq!(frames.allocate_frame(), Ok(frame(2)));
        assert_eq!(frames.allocate_frame(), Ok(frame(4)));
        assert_eq!(frames.allocate_frame(), Ok(frame(5)));

        // At the top the scan wraps to the start.
        frames.free_frame(a).unwrap();
        assert_eq!(frames.allocate_frame(), Ok(frame(1)));
        assert_eq!(frames.allocate_frame(), Err(FrameAllocError::OutOfMemory));
    }

    #[test]
    fn scan_crosses_word_boundaries() {
        let map = [usable(0, 200 * PAGE_SIZE)];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        for n in 1..200 {
            assert_eq!(frames.allocate_frame(), Ok(frame(n)));
        }
        frames.free_frame(frame(130)).unwrap();
        frames.free_frame(frame(70)).unwrap();
        assert_eq!(frames.allocate_frame(), Ok(frame(70)));
        assert_eq!(frames.allocate_frame(), Ok(frame(130)));
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let map = [usable(0, 16 * PAGE_SIZE)];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        let blocker = [frame(1), frame(2), frame(3)].map(|_| frames.allocate_frame().unwrap());
        frames.free_frame(blocker[1]).unwrap();

        // Frame 2 is a one-frame hole; a three-frame run starts at 4.
        let run = frames.allocate_contiguous(3).unwrap();
        assert_eq!(run, frame(4));
        for n in 4..7 {
            assert_eq!(frames.ref_count(frame(n)), 1);
        }
        assert_eq!(frames.allocate_contiguous(0), Err(FrameAllocError::OutOfMemory));
        assert_eq!(frames.allocate_contiguous(100), Err(FrameAllocError::OutOfMemory));

        frames.free_contiguous(run, 3).unwrap();
        assert_eq!(frames.allocate_contiguous(4), Ok(frame(4)));
    }

    #[test]
    fn trait_adapter_reports_and_tolerates_misuse() {
        let map = [usable(0, 4 * PAGE_SIZE)];
        let mut frames = BitmapFrameAlloc::new(&boot(&map));
        let f = frames.alloc_4k().unwrap();
        FrameAlloc::share(&mut frames, f);
        assert_eq!(FrameAlloc::ref_count(&frames, f), 2);
        assert!(!frames.release(f));
        assert!(frames.release(f));
        // A double release is logged and ignored.
        assert!(!frames.release(f));
        assert_eq!(frames.free_frames(), 3);
    }
}
