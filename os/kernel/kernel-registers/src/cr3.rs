//! The active address space.

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{FrameNumber, PhysicalPage};

/// CR3 with PCID disabled: the frame of the top-level table plus two cache
/// controls for walks through it.
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3)]
    _rsvd_low: u8,

    /// PWT for accesses to the root table.
    pub write_through: bool,

    /// PCD for accesses to the root table.
    pub cache_disable: bool,

    #[bits(7)]
    _rsvd_mid: u8,

    /// Bits 12..52.
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    _rsvd_high: u16,
}

impl Cr3 {
    /// Select `root`, walked with write-back caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage) -> Self {
        Self::new().with_root_frame(root.frame().as_u64())
    }

    /// The table this value selects.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        PhysicalPage::from_frame(FrameNumber::new(self.root_frame()))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

/// Loading CR3 also drops every non-global translation.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.into_bits(), options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sits_in_bits_12_and_up() {
        let root = PhysicalPage::from_frame(FrameNumber::new(0x1_2345));
        let cr3 = Cr3::from_root(root);
        assert_eq!(cr3.into_bits(), 0x1234_5000);
        assert_eq!(cr3.root(), root);
        assert!(!cr3.write_through() && !cr3.cache_disable());
    }

    #[test]
    fn flag_bits_do_not_leak_into_the_root() {
        let cr3 = Cr3::from_bits(0x8000_0000_1234_5018);
        assert!(cr3.write_through() && cr3.cache_disable());
        assert_eq!(cr3.root().frame().as_u64(), 0x1_2345);
    }
}
