//! # Per-process Virtual Memory
//!
//! [`UserMemory`] pairs a user page-table root with the [`VmaList`]
//! describing it. It is the unit that threads of one process share and the
//! thing `fork`, `exec`, `mmap`, `munmap` and `brk` operate on.
//!
//! Nothing here locks. The owner serializes access (one lock per address
//! space) and passes in the frame allocator, which it locks *after* the
//! address space.

use kernel_info::memory::USER_HALF_END;
use kernel_memory_addresses::{
    PAGE_SIZE, PageRange, VirtualAddress, VirtualPage, checked_align_up,
};
use kernel_vmem::{
    AddressSpace, ForkError, FrameAlloc, MapError, Mmu, PhysMapper, RootPage, Vma, VmaError,
    VmaFlags, VmaList,
};
use log::{debug, trace};

use crate::fault::{FaultAccess, FaultError};

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid user range starting at {0}")]
    BadAddress(VirtualAddress),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Vma(#[from] VmaError),
    #[error(transparent)]
    Fault(#[from] FaultError),
}

/// A user address space: page tables plus memory areas.
#[derive(Debug)]
pub struct UserMemory {
    root: RootPage,
    vmas: VmaList,
}

impl UserMemory {
    /// An empty user space sharing the kernel half of `kernel_root`.
    ///
    /// # Errors
    /// [`VmmError::Map`] if the root can't be allocated.
    pub fn new<M: PhysMapper, A: FrameAlloc>(
        mapper: &M,
        alloc: &mut A,
        kernel_root: RootPage,
    ) -> Result<Self, VmmError> {
        let space = AddressSpace::new_user(mapper, alloc, kernel_root)?;
        Ok(Self {
            root: space.root_page(),
            vmas: VmaList::new(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root
    }

    #[inline]
    pub const fn space<'m, M: PhysMapper>(&self, mapper: &'m M) -> AddressSpace<'m, M> {
        AddressSpace::from_root(mapper, self.root)
    }

    #[inline]
    #[must_use]
    pub const fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    #[inline]
    pub const fn vmas_mut(&mut self) -> &mut VmaList {
        &mut self.vmas
    }

    /// Copy-on-write clone: page tables via [`AddressSpace::fork`], areas and
    /// heap cursors by value. Shared areas stay writable in both.
    ///
    /// # Errors
    /// [`VmmError::Fork`]; the partial child is already gone.
    pub fn fork<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
    ) -> Result<Self, VmmError> {
        let child = self
            .space(mapper)
            .fork(alloc, mmu, |va| self.vmas.is_shared(va))?;
        Ok(Self {
            root: child.root_page(),
            vmas: self.vmas.clone(),
        })
    }

    /// Release every user frame, table and the root.
    pub fn destroy<M: PhysMapper, A: FrameAlloc>(self, mapper: &M, alloc: &mut A) {
        let resident = self.resident_pages(mapper);
        self.space(mapper).destroy(alloc);
        debug!(
            "destroyed user memory {:?} ({} areas, {resident} resident pages)",
            self.root,
            self.vmas.len()
        );
    }

    /// Number of present user pages.
    pub fn resident_pages<M: PhysMapper>(&self, mapper: &M) -> usize {
        self.space(mapper).resident_pages()
    }

    /// Record an area. No frames are allocated.
    ///
    /// # Errors
    /// [`VmmError::Vma`] on overlap.
    pub fn add_area(&mut self, vma: Vma) -> Result<(), VmmError> {
        self.vmas.insert(vma)?;
        trace!("area {}..{} {:?}", vma.start, vma.end, vma.flags);
        Ok(())
    }

    /// Reserve `[start, start + len)` as a demand-paged anonymous area.
    ///
    /// # Errors
    /// [`VmmError::Vma`] for unaligned, empty or overlapping ranges.
    pub fn map_anonymous(
        &mut self,
        start: VirtualAddress,
        len: u64,
        flags: VmaFlags,
    ) -> Result<Vma, VmmError> {
        let end = checked_align_up(start.as_u64().saturating_add(len), PAGE_SIZE)
            .ok_or(VmmError::BadAddress(start))?;
        let vma = Vma::anonymous(start, VirtualAddress::new(end), flags)?;
        self.add_area(vma)?;
        Ok(vma)
    }

    /// Eagerly back every page of `[start, end)` that isn't resident yet with
    /// a zeroed frame. The range must lie inside one area.
    ///
    /// # Errors
    /// [`VmmError::BadAddress`] outside an area, [`VmmError::OutOfMemory`].
    pub fn populate<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmmError> {
        let vma = self
            .vmas
            .find(start)
            .filter(|v| end <= v.end)
            .ok_or(VmmError::BadAddress(start))?;
        let space = self.space(mapper);
        for page in PageRange::new(start, end) {
            if space.entry(page.base()).is_some_and(|e| e.is_present()) {
                continue;
            }
            let frame = alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
            mapper.zero_frame(frame);
            if let Err(e) = space.map(alloc, page, frame, vma.flags.page_flags()) {
                alloc.release(frame);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Write `data` at `va` with kernel privilege, ignoring the areas'
    /// write permission. Missing pages are populated.
    ///
    /// Used to place image segments and the initial stack before the space
    /// ever runs; the range must be covered by areas.
    ///
    /// # Errors
    /// [`VmmError::BadAddress`] outside the areas, [`VmmError::OutOfMemory`].
    pub fn load_bytes<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        va: VirtualAddress,
        data: &[u8],
    ) -> Result<(), VmmError> {
        let end = user_range_end(va, data.len())?;
        for page in PageRange::new(va, end) {
            self.populate(mapper, alloc, page.base(), page.next().base())?;
        }
        self.for_each_chunk(mapper, va, data.len(), |bytes, offset| {
            bytes.copy_from_slice(&data[offset..offset + bytes.len()]);
        })
    }

    /// Copy `src` into user memory at `dst`, resolving missing and
    /// copy-on-write pages the way a user write fault would.
    ///
    /// # Errors
    /// [`VmmError::BadAddress`] for ranges leaving the user half,
    /// [`VmmError::Fault`] if a page can't be made writable.
    pub fn copy_to_user<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        dst: VirtualAddress,
        src: &[u8],
    ) -> Result<(), VmmError> {
        self.make_accessible(mapper, alloc, mmu, dst, src.len(), FaultAccess::USER_WRITE)?;
        self.for_each_chunk(mapper, dst, src.len(), |bytes, offset| {
            bytes.copy_from_slice(&src[offset..offset + bytes.len()]);
        })
    }

    /// Copy user memory at `src` into `dst`.
    ///
    /// # Errors
    /// As [`copy_to_user`](Self::copy_to_user), for read access.
    pub fn copy_from_user<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        src: VirtualAddress,
        dst: &mut [u8],
    ) -> Result<(), VmmError> {
        self.make_accessible(mapper, alloc, mmu, src, dst.len(), FaultAccess::USER_READ)?;
        self.for_each_chunk(mapper, src, dst.len(), |bytes, offset| {
            dst[offset..offset + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// Reserve `len` bytes below the `mmap` base as an anonymous area.
    ///
    /// # Errors
    /// [`VmmError::Vma`] if the range is empty or no gap fits.
    pub fn mmap(&mut self, len: u64, flags: VmaFlags) -> Result<VirtualAddress, VmmError> {
        let len = checked_align_up(len, PAGE_SIZE)
            .filter(|&l| l > 0)
            .ok_or(VmaError::NoSpace(len))?;
        let start = self.vmas.find_free(len)?;
        let vma = self.map_anonymous(start, len, flags)?;
        debug!("mmap {:#x} bytes at {}", vma.len(), vma.start);
        Ok(start)
    }

    /// Remove `[addr, addr + len)` from the areas, unmap its resident pages
    /// and release their frames.
    ///
    /// # Errors
    /// [`VmmError::BadAddress`] for unaligned or non-user ranges.
    pub fn munmap<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        addr: VirtualAddress,
        len: u64,
    ) -> Result<(), VmmError> {
        if !addr.is_page_aligned() || len == 0 {
            return Err(VmmError::BadAddress(addr));
        }
        let end = checked_align_up(addr.as_u64().saturating_add(len), PAGE_SIZE)
            .filter(|&e| e <= USER_HALF_END)
            .ok_or(VmmError::BadAddress(addr))?;
        let removed = self.vmas.remove(addr, VirtualAddress::new(end));
        for vma in &removed {
            self.unmap_range(mapper, alloc, mmu, vma.start, vma.end);
        }
        debug!("munmap {addr}..{:#x}: {} areas touched", end, removed.len());
        Ok(())
    }

    /// Move the program break.
    ///
    /// A request below the heap start or one that would collide with another
    /// area leaves the break where it is. Returns the (possibly unchanged)
    /// break.
    pub fn brk<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        requested: VirtualAddress,
    ) -> VirtualAddress {
        let start = self.vmas.start_brk();
        let current = self.vmas.brk();
        if requested < start || requested.as_u64() >= USER_HALF_END {
            return current;
        }

        let Some(old_end) = checked_align_up(current.as_u64(), PAGE_SIZE) else {
            return current;
        };
        let Some(new_end) = checked_align_up(requested.as_u64(), PAGE_SIZE) else {
            return current;
        };
        let (old_end, new_end) = (VirtualAddress::new(old_end), VirtualAddress::new(new_end));

        let resized = if new_end == old_end {
            Ok(())
        } else if new_end == start {
            self.vmas.remove(start, old_end);
            Ok(())
        } else if old_end == start {
            Vma::anonymous(start, new_end, VmaFlags::USER_RW).and_then(|v| self.vmas.insert(v))
        } else {
            self.vmas.resize(start, new_end)
        };
        if let Err(e) = resized {
            debug!("brk to {requested} refused: {e}");
            return current;
        }

        if new_end < old_end {
            self.unmap_range(mapper, alloc, mmu, new_end, old_end);
        }
        self.vmas.set_brk(requested);
        trace!("brk {current} -> {requested}");
        requested
    }

    /// Unmap every resident page of `[start, end)` and release its frame.
    fn unmap_range<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        let space = self.space(mapper);
        for page in PageRange::new(start, end) {
            if let Some(frame) = space.unmap(page, mmu) {
                alloc.release(frame);
            }
        }
    }

    /// Fault in every page of `[va, va + len)` that doesn't permit `access` yet.
    fn make_accessible<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        va: VirtualAddress,
        len: usize,
        access: FaultAccess,
    ) -> Result<(), VmmError> {
        let end = user_range_end(va, len)?;
        let space = self.space(mapper);
        let mut page = VirtualPage::containing(va);
        while page.base() < end {
            let ready = space
                .entry(page.base())
                .is_some_and(|e| e.is_present() && e.is_user() && (e.is_writable() || !access.write));
            if !ready {
                let addr = page.base().max(va);
                self.resolve_fault(mapper, alloc, mmu, addr, access)?;
            }
            page = page.next();
        }
        Ok(())
    }

    /// Call `f` with the bytes of each resident page piece of `[va, va + len)`
    /// and the offset of that piece within the range.
    fn for_each_chunk<M: PhysMapper>(
        &self,
        mapper: &M,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), VmmError> {
        let space = self.space(mapper);
        let mut done = 0usize;
        while done < len {
            let at = va + done as u64;
            let pa = space.translate(at).ok_or(VmmError::BadAddress(at))?;
            let in_page = (PAGE_SIZE - at.offset_in_page()) as usize;
            let n = in_page.min(len - done);
            let frame = unsafe { mapper.frame_bytes(pa.page()) };
            let offset = pa.offset_in_page() as usize;
            f(&mut frame[offset..offset + n], done);
            done += n;
        }
        Ok(())
    }
}

/// End of `[va, va + len)` if the range lies in the user half.
fn user_range_end(va: VirtualAddress, len: usize) -> Result<VirtualAddress, VmmError> {
    va.checked_add(len as u64)
        .filter(|end| va.is_user() && end.as_u64() <= USER_HALF_END)
        .ok_or(VmmError::BadAddress(va))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Machine;
    use kernel_vmem::info::MMAP_BASE;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn user_copies_validate_the_range() {
        let mut m = Machine::new(128);
        let mut mem = m.user_memory();
        mem.map_anonymous(va(0x1000), 0x2000, VmaFlags::USER_RW).unwrap();

        // Crosses the page boundary at 0x2000.
        let data: Vec<u8> = (0..32).collect();
        mem.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x1FF0), &data)
            .unwrap();
        let mut back = [0u8; 32];
        mem.copy_from_user(&m.mapper, &mut m.frames, &m.mmu, va(0x1FF0), &mut back)
            .unwrap();
        assert_eq!(&back[..], &data[..]);
        assert_eq!(mem.resident_pages(&m.mapper), 2);

        assert_eq!(
            mem.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x2FFF), &[1, 2]),
            Err(VmmError::Fault(FaultError::NoVma(va(0x3000))))
        );
        assert_eq!(
            mem.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(USER_HALF_END - 1), &[1, 2]),
            Err(VmmError::BadAddress(va(USER_HALF_END - 1)))
        );
        assert_eq!(
            mem.copy_from_user(
                &m.mapper,
                &mut m.frames,
                &m.mmu,
                va(0xFFFF_8880_0000_0000),
                &mut back
            ),
            Err(VmmError::BadAddress(va(0xFFFF_8880_0000_0000)))
        );
        mem.destroy(&m.mapper, &mut m.frames);
        assert_eq!(m.frames.free_frames(), m.baseline);
    }

    #[test]
    fn load_bytes_ignores_area_write_permission() {
        let mut m = Machine::new(128);
        let mut mem = m.user_memory();
        mem.map_anonymous(va(0x40_0000), 0x2000, VmaFlags::READ | VmaFlags::USER)
            .unwrap();
        mem.load_bytes(&m.mapper, &mut m.frames, va(0x40_0FFE), &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(mem.resident_pages(&m.mapper), 2);

        let mut back = [0u8; 4];
        mem.copy_from_user(&m.mapper, &mut m.frames, &m.mmu, va(0x40_0FFE), &mut back)
            .unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
        assert!(matches!(
            mem.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x40_0000), &[9]),
            Err(VmmError::Fault(FaultError::WriteToReadOnly(_)))
        ));
        assert!(!mem.space(&m.mapper).entry(va(0x40_0000)).unwrap().is_writable());
    }

    #[test]
    fn mmap_and_munmap_release_frames() {
        let mut m = Machine::new(256);
        let mut mem = m.user_memory();
        let at = mem.mmap(0x3000, VmaFlags::USER_RW).unwrap();
        assert_eq!(at, va(MMAP_BASE - 0x3000));
        let next = mem.mmap(0x1000, VmaFlags::USER_RW).unwrap();
        assert_eq!(next, va(MMAP_BASE - 0x4000));

        mem.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, at, &[1; 0x3000])
            .unwrap();
        assert_eq!(mem.resident_pages(&m.mapper), 3);
        let free = m.frames.free_frames();

        // Punch out the middle page.
        mem.munmap(&m.mapper, &mut m.frames, &m.mmu, at + 0x1000, 0x1000)
            .unwrap();
        assert_eq!(mem.resident_pages(&m.mapper), 2);
        assert_eq!(m.frames.free_frames(), free + 1);
        assert_eq!(mem.vmas().len(), 3);
        assert!(mem.vmas().find(at + 0x1000).is_none());

        // The hole is reused by the next small mapping.
        assert_eq!(mem.mmap(0x1000, VmaFlags::USER_RW).unwrap(), at + 0x1000);

        assert_eq!(
            mem.munmap(&m.mapper, &mut m.frames, &m.mmu, at + 1, 0x1000),
            Err(VmmError::BadAddress(at + 1))
        );
    }

    #[test]
    fn brk_grows_and_shrinks_the_heap() {
        let mut m = Machine::new(256);
        let mut mem = m.user_memory();
        mem.vmas_mut().set_heap_start(va(0x60_0000));
        mem.map_anonymous(va(0x60_4000), 0x1000, VmaFlags::USER_RW).unwrap();

        assert_eq!(mem.brk(&m.mapper, &mut m.frames, &m.mmu, va(0)), va(0x60_0000));
        assert_eq!(mem.brk(&m.mapper, &mut m.frames, &m.mmu, va(0x60_1800)), va(0x60_1800));
        assert_eq!(mem.vmas().find(va(0x60_1000)).unwrap().end, va(0x60_2000));

        mem.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x60_1000), &[7])
            .unwrap();
        assert_eq!(mem.brk(&m.mapper, &mut m.frames, &m.mmu, va(0x60_3000)), va(0x60_3000));
        // Running into the area above is refused.
        assert_eq!(mem.brk(&m.mapper, &mut m.frames, &m.mmu, va(0x60_5000)), va(0x60_3000));

        assert_eq!(mem.brk(&m.mapper, &mut m.frames, &m.mmu, va(0x60_1000)), va(0x60_1000));
        assert_eq!(mem.resident_pages(&m.mapper), 0);
        assert_eq!(mem.brk(&m.mapper, &mut m.frames, &m.mmu, va(0x60_0000)), va(0x60_0000));
        assert!(mem.vmas().find(va(0x60_0000)).is_none());
        assert_eq!(mem.vmas().len(), 1);
    }

    #[test]
    fn fork_copies_areas_and_shares_frames() {
        let mut m = Machine::new(256);
        let mut parent = m.user_memory();
        parent.map_anonymous(va(0x1000), 0x1000, VmaFlags::USER_RW).unwrap();
        parent
            .map_anonymous(va(0x8000), 0x1000, VmaFlags::USER_RW | VmaFlags::SHARED)
            .unwrap();
        parent.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x1000), &[1]).unwrap();
        parent.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x8000), &[2]).unwrap();

        let child = parent.fork(&m.mapper, &mut m.frames, &m.mmu).unwrap();
        assert_eq!(child.vmas().len(), 2);
        // Writes to the shared area are visible to both sides.
        child.copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x8000), &[3]).unwrap();
        let mut b = [0];
        parent.copy_from_user(&m.mapper, &mut m.frames, &m.mmu, va(0x8000), &mut b).unwrap();
        assert_eq!(b, [3]);

        child.destroy(&m.mapper, &mut m.frames);
        parent.destroy(&m.mapper, &mut m.frames);
        assert_eq!(m.frames.free_frames(), m.baseline);
    }
}
