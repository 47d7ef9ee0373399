//! # Model-Specific Registers (MSR) utilities
//!
//! Low-level access to CPU **Model-Specific Registers (MSRs)** through the
//! privileged `RDMSR` and `WRMSR` instructions.
//!
//! The scheduler only needs one of them: `IA32_FS_BASE` (`0xC000_0100`),
//! the base of the FS segment. User-space runtimes keep their thread pointer
//! there, so it is part of every task's saved context and is reloaded on
//! each switch to a user task.
//!
//! ## References
//! - Intel SDM Vol. 3, §2.5.4 “FS and GS Base Address Registers”
//! - AMD64 Architecture Programmer’s Manual Vol. 2, §4.8.3 “MSRs for FS/GS Base”

mod ia32_fs_base;

pub use ia32_fs_base::Ia32FsBase;

/// Identifies a **Model-Specific Register (MSR)** by its architectural index.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    /// Creates a new `Msr` from a raw index.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying raw MSR index.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Write a 64-bit value to this MSR.
    ///
    /// # Safety
    /// - Executes `WRMSR`, which is only valid at **CPL=0**; in user mode it
    ///   raises **#GP(0)**.
    /// - The MSR must be valid and writable on the current CPU.
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    #[doc(alias = "write_model_specific_register")]
    pub unsafe fn store_raw(self, val: u64) {
        let lo = (val & 0xFFFF_FFFF) as u32;
        let hi = (val >> 32) as u32;
        let msr = self.raw();
        unsafe {
            core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
            options(nostack, preserves_flags)
            );
        }
    }

    /// Reads the 64-bit value of this MSR.
    ///
    /// # Safety
    /// Same as [`store_raw`](Self::store_raw).
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    #[doc(alias = "read_model_specific_register")]
    pub unsafe fn load_raw(self) -> u64 {
        let lo: u32;
        let hi: u32;
        let ecx = self.raw();
        unsafe {
            core::arch::asm!(
            "rdmsr",
            in("ecx") ecx,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}

/// Canonical if bits 63..48 are all copies of bit 47.
#[inline(always)]
#[allow(clippy::inline_always)]
#[must_use]
pub const fn is_canonical(addr: u64) -> bool {
    let sign = (addr >> 47) & 1;
    (addr >> 48) == if sign == 0 { 0 } else { 0xFFFF }
}
