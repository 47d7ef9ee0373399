//! The flags register, as far as a fresh context cares.

use bitfield_struct::bitfield;

/// RFLAGS of a saved context.
///
/// Arithmetic flags are lumped together; a new context never sets them and
/// the scheduler never looks at them. Bit 1 is fixed to one.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// CF.
    pub carry: bool,

    #[bits(default = true)]
    _fixed: bool,

    /// PF, AF, ZF, SF and the reserved bits between them.
    #[bits(6)]
    pub status: u8,

    /// TF: single-step.
    pub trap: bool,

    /// IF: maskable interrupts are delivered.
    pub interrupts: bool,

    /// DF.
    pub direction: bool,

    /// OF.
    pub overflow: bool,

    /// IOPL: lowest ring allowed to use `in`/`out`.
    #[bits(2)]
    pub iopl: u8,

    #[bits(50)]
    _rsvd: u64,
}

impl Rflags {
    /// Flags every new context starts with: interrupts on, ring-0 I/O only
    /// (`0x202`).
    pub const INITIAL: Self = Self::new().with_interrupts(true);
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegister for Rflags {
    #[inline]
    fn load() -> Self {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
        Self::from_bits(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_flags_are_0x202() {
        assert_eq!(Rflags::INITIAL.into_bits(), 0x202);
        assert!(Rflags::INITIAL.interrupts());
        assert_eq!(Rflags::INITIAL.iopl(), 0);
    }

    #[test]
    fn user_flags_decode() {
        let f = Rflags::from_bits(0x3246);
        assert!(f.interrupts());
        assert_eq!(f.iopl(), 3);
        assert!(!f.carry());
    }
}
