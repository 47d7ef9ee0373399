//! TLB maintenance on the local core.

use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation for the page containing `va` (`invlpg`).
///
/// # Safety
/// CPL0 only.
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Drop every non-global cached translation by rewriting CR3 with itself.
///
/// # Safety
/// CPL0 only.
#[inline]
pub unsafe fn flush_all() {
    use crate::cr3::Cr3;
    use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
    unsafe { Cr3::load_unsafe().store_unsafe() }
}
