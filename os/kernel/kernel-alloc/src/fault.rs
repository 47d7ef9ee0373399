//! # Page Fault Resolution
//!
//! Decides what a page fault in a user address space means:
//!
//! | Leaf                   | Access | VMA       | Outcome                         |
//! |------------------------|--------|-----------|---------------------------------|
//! | not present            | any    | permits   | demand-allocate a zeroed frame  |
//! | present, read-only     | write  | writable  | copy-on-write or flip writable  |
//! | present, satisfies it  | any    | permits   | spurious; flush the stale entry |
//! | any                    | any    | none      | [`FaultError::NoVma`]           |
//! | any                    | write  | read-only | [`FaultError::WriteToReadOnly`] |
//!
//! Every resolved fault invalidates the page on the local core.

use crate::vmm::UserMemory;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_vmem::{FrameAlloc, MapError, Mmu, PhysMapper, VmaFlags};
use log::{debug, trace};

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// What the faulting access tried to do.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FaultAccess {
    pub write: bool,
    pub user: bool,
    pub execute: bool,
}

impl FaultAccess {
    pub const USER_READ: Self = Self {
        write: false,
        user: true,
        execute: false,
    };

    pub const USER_WRITE: Self = Self {
        write: true,
        user: true,
        execute: false,
    };
}

impl From<PageFaultError> for FaultAccess {
    fn from(err: PageFaultError) -> Self {
        Self {
            write: err.write(),
            user: err.user(),
            execute: err.instruction_fetch(),
        }
    }
}

/// How a fault was healed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultResolution {
    /// A zeroed frame now backs the page.
    DemandAllocated,
    /// The shared frame was copied into a private one.
    CopiedOnWrite,
    /// The writer was the last owner; the entry became writable in place.
    MadeWritable,
    /// The leaf already permitted the access; only the stale translation was dropped.
    Spurious,
}

/// The fault cannot be healed; the faulting context must not resume.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FaultError {
    #[error("{0} lies outside the user half")]
    KernelAddress(VirtualAddress),
    #[error("no memory area covers {0}")]
    NoVma(VirtualAddress),
    #[error("write to read-only area at {0}")]
    WriteToReadOnly(VirtualAddress),
    #[error("instruction fetch from non-executable area at {0}")]
    ExecuteDenied(VirtualAddress),
    #[error("out of memory resolving fault at {0}")]
    OutOfMemory(VirtualAddress),
    #[error("unhandled fault at {0}")]
    Unhandled(VirtualAddress),
}

impl UserMemory {
    /// Heal a fault at `addr` in this address space, if the VMA list allows it.
    ///
    /// # Errors
    /// See [`FaultError`]. On error nothing was changed.
    pub fn resolve_fault<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        mmu: &impl Mmu,
        addr: VirtualAddress,
        access: FaultAccess,
    ) -> Result<FaultResolution, FaultError> {
        if !addr.is_user() {
            return Err(FaultError::KernelAddress(addr));
        }
        let vma = self.vmas().find(addr).ok_or(FaultError::NoVma(addr))?;
        if access.write && !vma.flags.contains(VmaFlags::WRITE) {
            return Err(FaultError::WriteToReadOnly(addr));
        }
        if access.execute && !vma.flags.contains(VmaFlags::EXEC) {
            return Err(FaultError::ExecuteDenied(addr));
        }

        let space = self.space(mapper);
        let page = VirtualPage::containing(addr);
        let entry = space.entry(addr).filter(|e| e.is_present());

        let Some(entry) = entry else {
            let frame = alloc.alloc_4k().ok_or(FaultError::OutOfMemory(addr))?;
            mapper.zero_frame(frame);
            if let Err(e) = space.map(alloc, page, frame, vma.flags.page_flags()) {
                alloc.release(frame);
                return Err(match e {
                    MapError::OutOfMemory(_) => FaultError::OutOfMemory(addr),
                    MapError::AlreadyMapped(_) | MapError::NonCanonical(_) => {
                        FaultError::Unhandled(addr)
                    }
                });
            }
            mmu.invalidate_page(page);
            trace!("demand-allocated {page:?} -> {frame:?}");
            return Ok(FaultResolution::DemandAllocated);
        };

        if access.write && !entry.is_writable() {
            let old = entry.frame();
            if alloc.ref_count(old) > 1 {
                let copy = alloc.alloc_4k().ok_or(FaultError::OutOfMemory(addr))?;
                mapper.copy_frame(old, copy);
                space.update(page, mmu, |e| e.with_frame(copy).with_writable(true));
                alloc.release(old);
                debug!("copy-on-write {page:?}: {old:?} -> {copy:?}");
                return Ok(FaultResolution::CopiedOnWrite);
            }
            space.update(page, mmu, |e| e.with_writable(true));
            trace!("copy-on-write {page:?}: sole owner of {old:?}");
            return Ok(FaultResolution::MadeWritable);
        }

        if entry.is_user() || !access.user {
            mmu.invalidate_page(page);
            return Ok(FaultResolution::Spurious);
        }
        Err(FaultError::Unhandled(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Machine;
    use kernel_vmem::{Vma, VmaKind};

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn error_code_maps_to_access() {
        let err = PageFaultError::from_bits(0b110);
        let access = FaultAccess::from(err);
        assert_eq!(access, FaultAccess::USER_WRITE);
        assert_eq!(err.explain(), "Non-present page (page not mapped)");
        assert!(FaultAccess::from(PageFaultError::from_bits(0b10101)).execute);
    }

    #[test]
    fn touching_a_fresh_area_allocates_exactly_one_frame() {
        let mut m = Machine::new(256);
        let mut mem = m.user_memory();
        mem.map_anonymous(va(0x10_0000), 0x4000, VmaFlags::USER_RW).unwrap();
        assert_eq!(mem.resident_pages(&m.mapper), 0);

        let free = m.frames.free_frames();
        let r = mem.resolve_fault(&m.mapper, &mut m.frames, &m.mmu, va(0x10_1234), FaultAccess::USER_READ);
        assert_eq!(r, Ok(FaultResolution::DemandAllocated));
        assert_eq!(mem.resident_pages(&m.mapper), 1);
        // One data frame plus PDPT, PD and PT.
        assert_eq!(free - m.frames.free_frames(), 4);
        assert_eq!(m.mmu.invalidated(), [VirtualPage::containing(va(0x10_1000))]);

        let mut buf = [0xFFu8; 8];
        mem.copy_from_user(&m.mapper, &mut m.frames, &m.mmu, va(0x10_1234), &mut buf)
            .unwrap();
        assert_eq!(buf, [0; 8]);

        let e = mem.space(&m.mapper).entry(va(0x10_1000)).unwrap();
        assert!(e.is_user() && e.is_writable());
        mem.destroy(&m.mapper, &mut m.frames);
    }

    #[test]
    fn invalid_accesses_are_rejected() {
        let mut m = Machine::new(64);
        let mut mem = m.user_memory();
        mem.add_area(
            Vma::new(
                va(0x40_0000),
                va(0x40_1000),
                VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER,
                VmaKind::File { offset: 0 },
            )
            .unwrap(),
        )
        .unwrap();
        mem.map_anonymous(va(0x50_0000), 0x1000, VmaFlags::USER_RW).unwrap();

        let mut resolve = |addr: u64, access| {
            mem.resolve_fault(&m.mapper, &mut m.frames, &m.mmu, va(addr), access)
        };
        assert_eq!(
            resolve(0xFFFF_8000_0000_1000, FaultAccess::default()),
            Err(FaultError::KernelAddress(va(0xFFFF_8000_0000_1000)))
        );
        assert_eq!(
            resolve(0x1000, FaultAccess::USER_READ),
            Err(FaultError::NoVma(va(0x1000)))
        );
        assert_eq!(
            resolve(0x40_0010, FaultAccess::USER_WRITE),
            Err(FaultError::WriteToReadOnly(va(0x40_0010)))
        );
        let fetch = FaultAccess {
            execute: true,
            ..FaultAccess::USER_READ
        };
        assert_eq!(
            resolve(0x50_0000, fetch),
            Err(FaultError::ExecuteDenied(va(0x50_0000)))
        );
        assert_eq!(resolve(0x40_0000, fetch), Ok(FaultResolution::DemandAllocated));
        // The leaf is present and already permits the fetch.
        assert_eq!(resolve(0x40_0000, fetch), Ok(FaultResolution::Spurious));
    }

    #[test]
    fn copy_on_write_after_fork() {
        let mut m = Machine::new(256);
        let mut parent = m.user_memory();
        parent.map_anonymous(va(0x20_0000), 0x1000, VmaFlags::USER_RW).unwrap();
        parent
            .copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x20_0000), &[0xAA])
            .unwrap();
        let original = parent.space(&m.mapper).entry(va(0x20_0000)).unwrap().frame();

        let child = parent.fork(&m.mapper, &mut m.frames, &m.mmu).unwrap();
        assert_eq!(m.frames.ref_count(original), 2);

        let r = child.resolve_fault(&m.mapper, &mut m.frames, &m.mmu, va(0x20_0000), FaultAccess::USER_WRITE);
        assert_eq!(r, Ok(FaultResolution::CopiedOnWrite));
        child
            .copy_to_user(&m.mapper, &mut m.frames, &m.mmu, va(0x20_0000), &[0xBB])
            .unwrap();

        let mut p = [0];
        let mut c = [0];
        parent.copy_from_user(&m.mapper, &mut m.frames, &m.mmu, va(0x20_0000), &mut p).unwrap();
        child.copy_from_user(&m.mapper, &mut m.frames, &m.mmu, va(0x20_0000), &mut c).unwrap();
        assert_eq!((p, c), ([0xAA], [0xBB]));

        let copy = child.space(&m.mapper).entry(va(0x20_0000)).unwrap().frame();
        assert_ne!(copy, original);
        assert_eq!(m.frames.ref_count(original), 1);
        assert_eq!(m.frames.ref_count(copy), 1);

        // The parent is now the sole owner: its write fault flips the bit in place.
        let r = parent.resolve_fault(&m.mapper, &mut m.frames, &m.mmu, va(0x20_0000), FaultAccess::USER_WRITE);
        assert_eq!(r, Ok(FaultResolution::MadeWritable));
        assert_eq!(parent.space(&m.mapper).entry(va(0x20_0000)).unwrap().frame(), original);

        child.destroy(&m.mapper, &mut m.frames);
        parent.destroy(&m.mapper, &mut m.frames);
        assert_eq!(m.frames.free_frames(), m.baseline);
    }

    #[test]
    fn out_of_memory_leaves_the_page_unmapped() {
        let mut m = Machine::new(64);
        let mut mem = m.user_memory();
        mem.map_anonymous(va(0x30_0000), 0x1000, VmaFlags::USER_RW).unwrap();
        while m.frames.allocate_frame().is_ok() {}
        assert_eq!(
            mem.resolve_fault(&m.mapper, &mut m.frames, &m.mmu, va(0x30_0000), FaultAccess::USER_WRITE),
            Err(FaultError::OutOfMemory(va(0x30_0000)))
        );
        assert_eq!(mem.resident_pages(&m.mapper), 0);
    }
}
