//! # Hardware adapter
//!
//! Everything the scheduler needs from a core besides memory: its MMU, the
//! privileged stack pointer loaded on ring transitions (`TSS.RSP0`), the
//! thread pointer (`IA32_FS_BASE`) and a source of entropy. The scheduler
//! only ever touches the core it runs on.

use crate::cpu::CpuId;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::Mmu;

pub trait CoreHardware {
    type Mmu: Mmu;

    /// Translation hardware of `cpu`. Only valid when called on `cpu`.
    fn mmu(&self, cpu: CpuId) -> &Self::Mmu;

    /// Stack the core switches to when a user task traps.
    fn set_kernel_stack(&self, cpu: CpuId, top: VirtualAddress);

    /// User thread pointer of the task about to run.
    fn set_thread_pointer(&self, cpu: CpuId, base: u64);

    /// Seed material; quality is best-effort.
    fn entropy(&self) -> u64;
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use x86::{X86, X86Mmu};

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod x86 {
    use super::CoreHardware;
    use crate::cpu::CpuId;
    use alloc::vec::Vec;
    use core::ptr::NonNull;
    use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};
    use kernel_registers::{Cr3, Ia32FsBase, LoadRegisterUnsafe, StoreRegisterUnsafe, tlb};
    use kernel_vmem::Mmu;
    use log::warn;

    /// CR3 and `invlpg` of whichever core calls.
    #[derive(Debug, Default)]
    pub struct X86Mmu;

    impl Mmu for X86Mmu {
        #[inline]
        fn invalidate_page(&self, page: VirtualPage) {
            unsafe { tlb::invalidate_page(page.base()) }
        }

        #[inline]
        fn flush_all(&self) {
            unsafe { tlb::flush_all() }
        }

        #[inline]
        fn activate(&self, root: PhysicalPage) {
            unsafe { Cr3::from_root(root).store_unsafe() }
        }

        #[inline]
        fn active_root(&self) -> PhysicalPage {
            unsafe { Cr3::load_unsafe() }.root()
        }
    }

    /// Bare-metal cores.
    pub struct X86 {
        mmu: X86Mmu,
        /// `RSP0` slot of each core's TSS, indexed by [`CpuId`].
        rsp0: Vec<NonNull<u64>>,
    }

    // The RSP0 slots are only written by their own core.
    unsafe impl Send for X86 {}
    unsafe impl Sync for X86 {}

    impl X86 {
        /// # Safety
        /// Every pointer must reference the live `RSP0` field of the TSS
        /// loaded on the core with that index.
        #[must_use]
        pub const unsafe fn new(rsp0: Vec<NonNull<u64>>) -> Self {
            Self { mmu: X86Mmu, rsp0 }
        }
    }

    impl CoreHardware for X86 {
        type Mmu = X86Mmu;

        fn mmu(&self, _cpu: CpuId) -> &X86Mmu {
            &self.mmu
        }

        fn set_kernel_stack(&self, cpu: CpuId, top: VirtualAddress) {
            match self.rsp0.get(cpu.as_index()) {
                Some(slot) => unsafe { slot.as_ptr().write_volatile(top.as_u64()) },
                None => warn!("no TSS registered for core {cpu}"),
            }
        }

        fn set_thread_pointer(&self, _cpu: CpuId, base: u64) {
            match Ia32FsBase::thread_pointer(base) {
                Some(fs) => unsafe { fs.store_unsafe() },
                None => warn!("non-canonical thread pointer {base:#x} ignored"),
            }
        }

        fn entropy(&self) -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }
    }
}
