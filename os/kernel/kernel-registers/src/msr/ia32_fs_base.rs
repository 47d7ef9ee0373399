//! Provides the [`Ia32FsBase`] type.

use crate::msr::{Msr, is_canonical};
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// Model-Specific Register: current **FS base address**.
///
/// The CPU uses this value when resolving memory references through the FS
/// segment register (`mov %fs:offset, ...`). User-space TLS lives here.
///
/// In 64-bit mode, this value is 64 bits wide and read/writable through
/// `RDMSR`/`WRMSR` at index `0xC000_0100`.
#[bitfield(u64, order = Lsb)]
pub struct Ia32FsBase {
    #[bits(64)]
    #[doc(alias = "thread_pointer")]
    pub ptr: u64,
}

impl Ia32FsBase {
    pub const IA32_FS_BASE: u32 = 0xC000_0100;
    pub const MSR: Msr = Msr::new(Self::IA32_FS_BASE);

    /// FS base holding a user thread pointer.
    ///
    /// Returns `None` for non-canonical addresses, which `WRMSR` would
    /// reject with #GP.
    #[inline]
    #[must_use]
    pub const fn thread_pointer(addr: u64) -> Option<Self> {
        if is_canonical(addr) {
            Some(Self::new().with_ptr(addr))
        } else {
            None
        }
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Ia32FsBase {
    #[inline(always)]
    #[allow(clippy::inline_always)]
    unsafe fn load_unsafe() -> Self {
        let msr = unsafe { Self::MSR.load_raw() };
        Self::from_bits(msr)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Ia32FsBase {
    #[inline(always)]
    #[allow(clippy::inline_always)]
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR.store_raw(self.into_bits()) }
    }
}
