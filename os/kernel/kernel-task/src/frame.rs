//! # Saved register state
//!
//! [`TrapFrame`] is the full user-visible register set of a task as pushed by
//! the trap entry stubs: the general-purpose registers in push order followed
//! by the frame the CPU pushes on an interrupt gate (`RIP`, `CS`, `RFLAGS`,
//! `RSP`, `SS`).
//!
//! A task that is not running keeps its frame in its descriptor. Switching
//! tasks means writing the outgoing frame back and handing the trap stub the
//! incoming one to restore with `iretq`.

use kernel_memory_addresses::VirtualAddress;
use kernel_registers::Rflags;

/// GDT selectors, as laid out by the boot GDT.
///
/// ```text
/// Index | Selector | Descriptor
/// ------|----------|-------------------------
/// 1     | 0x08     | Kernel code (64-bit, DPL=0)
/// 2     | 0x10     | Kernel data (DPL=0)
/// 3     | 0x18     | User code (DPL=3) → with RPL=3: 0x1b
/// 4     | 0x20     | User data (DPL=3) → with RPL=3: 0x23
/// ```
pub mod selectors {
    pub const KERNEL_CS: u64 = 0x08;
    pub const KERNEL_DS: u64 = 0x10;
    pub const USER_CS: u64 = 0x18 | 3;
    pub const USER_DS: u64 = 0x20 | 3;
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct TrapFrame {
    // Pushed by the entry stub, last push first.
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    // Pushed by the CPU on interrupt gate entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Frame that enters `entry` in ring 0 on `stack_top` with interrupts on.
    #[must_use]
    pub fn kernel(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self {
            rip: entry.as_u64(),
            cs: selectors::KERNEL_CS,
            rflags: Rflags::INITIAL.into_bits(),
            rsp: stack_top.as_u64(),
            ss: selectors::KERNEL_DS,
            ..Self::default()
        }
    }

    /// Frame that enters `entry` in ring 3 on `stack_top` with interrupts on.
    #[must_use]
    pub fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self {
            rip: entry.as_u64(),
            cs: selectors::USER_CS,
            rflags: Rflags::INITIAL.into_bits(),
            rsp: stack_top.as_u64(),
            ss: selectors::USER_DS,
            ..Self::default()
        }
    }

    /// Whether the frame returns to ring 3.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Set the value the interrupted system call returns.
    pub const fn set_return(&mut self, value: u64) {
        self.rax = value;
    }

    #[must_use]
    pub const fn instruction_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.rip)
    }

    #[must_use]
    pub const fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.rsp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_frames_use_the_right_privilege() {
        let k = TrapFrame::kernel(VirtualAddress::new(0x1000), VirtualAddress::new(0x8000));
        assert_eq!((k.cs, k.ss, k.rflags), (0x08, 0x10, 0x202));
        assert!(!k.is_user());

        let u = TrapFrame::user(VirtualAddress::new(0x40_1000), VirtualAddress::new(0x7000));
        assert_eq!((u.cs, u.ss, u.rflags), (0x1b, 0x23, 0x202));
        assert!(u.is_user());
        assert_eq!(u.instruction_pointer(), VirtualAddress::new(0x40_1000));
        assert_eq!(u.rax, 0);
    }

    #[test]
    fn layout_matches_the_push_order() {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 20 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 19 * 8);
    }
}
