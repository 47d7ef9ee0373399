//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses, page bases and frame numbers
//! used by the frame allocator, the page-table code and the scheduler.
//!
//! ## Overview
//!
//! Mixing a physical address into a virtual-address slot (or a frame number
//! into a byte address) is the most common class of bug in paging code. The
//! types in this crate are zero-cost `u64` wrappers that make those mixups a
//! compile error:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory. |
//! | [`PhysicalPage`] | The 4 KiB aligned base of a physical frame. |
//! | [`FrameNumber`] | The index of a physical frame (`address >> 12`). |
//! | [`VirtualAddress`] | A byte address in a (translated) virtual address space. |
//! | [`VirtualPage`] | The 4 KiB aligned base of a virtual page. |
//!
//! Only the 4 KiB base granularity is modeled. The kernel never installs
//! huge pages in user address spaces, and the kernel half uses 4 KiB leaves
//! as well.
//!
//! ## Address Space Split
//!
//! x86-64 uses 48-bit canonical addresses. The lower half
//! (`0x0000_0000_0000_0000..0x0000_8000_0000_0000`) belongs to user space,
//! the higher half (`0xFFFF_8000_0000_0000..`) to the kernel. Anything in
//! between is non-canonical and faults on access.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7FFF_FFFF_E123);
//! assert!(va.is_user());
//! assert_eq!(va.page().base().as_u64(), 0x0000_7FFF_FFFF_E000);
//! assert_eq!(va.offset_in_page(), 0x123);
//!
//! let pa = PhysicalAddress::new(0x0040_2000);
//! assert_eq!(pa.page().frame(), FrameNumber::new(0x402));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_page::{FrameNumber, PhysicalPage};
pub use virtual_address::VirtualAddress;
pub use virtual_page::{PageRange, VirtualPage};

/// Size of a page and of a physical frame, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// First address past the canonical lower (user) half.
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// First address of the canonical higher (kernel) half.
pub const KERNEL_HALF_START: u64 = 0xFFFF_8000_0000_0000;

/// Align `x` down to a power-of-two `align`.
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to a power-of-two `align`, or `None` if that overflows.
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Number of pages needed to cover `len` bytes.
#[inline]
#[must_use]
pub const fn pages_for(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE)
}
