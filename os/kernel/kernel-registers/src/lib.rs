//! # Typed `X84_64` Registers
//!
//! The handful of registers the scheduler and memory core touch: CR3 for the
//! active address space, RFLAGS for fresh user contexts, the FS base MSR for
//! thread-local storage, and the TLB maintenance instructions in `tlb`.
//!
//! The bit layouts are always available. Loading and storing needs the
//! `asm` feature and an `x86_64` target.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod msr;
pub mod rflags;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub mod tlb;

pub use cr3::Cr3;
pub use msr::{Ia32FsBase, Msr};
pub use rflags::Rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// # Safety
    /// It is generally safe to load this register even from user mode.
    fn load() -> Self;
}

pub trait StoreRegister {
    /// # Safety
    /// It is generally safe to store this register even from user mode.
    fn store(self);
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}

impl<T> StoreRegisterUnsafe for T
where
    T: StoreRegister,
{
    #[inline]
    unsafe fn store_unsafe(self) {
        <Self as StoreRegister>::store(self);
    }
}
