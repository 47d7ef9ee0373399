//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot handoff consumed by the scheduler
//! and virtual-memory core. This crate is the single source of truth for the
//! address space layout shared by the frame allocator, the page-table code
//! and the task lifecycle manager.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants describing the virtual address space:
//! * **User/Kernel Split**: the canonical lower half belongs to user space
//! * **Direct Map**: all physical memory is visible at a fixed high offset
//! * **User Stacks**: main stack below the top of the user half, thread
//!   stacks in a dedicated region above the `mmap` base
//! * **Limits**: task slots, processor cores, kernel stack size
//!
//! ### Boot Information ([`boot`])
//! The runtime configuration handed over once at start-up:
//! * **Memory Map**: usable, reserved and kernel-image physical ranges
//! * **Direct-Map Offset**: where physical memory appears in the kernel half
//! * **Kernel Image**: virtual and physical placement of the kernel
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Program image, heap (brk)      │
//!                       │            ...                  │
//!                       │  mmap region (grows down)       │
//! MMAP_BASE             ├─────────────────────────────────┤ 0x0000_7FF0_0000_0000
//!                       │  Thread stacks                  │
//! THREAD_STACK_END      ├─────────────────────────────────┤ 0x0000_7FF8_0000_0000
//!                       │            ...                  │
//!                       │  Main user stack (grows down)   │
//! USER_STACK_TOP        ├─────────────────────────────────┤ 0x0000_7FFF_FFFF_F000
//!                       │  Non-canonical hole             │
//! DIRECT_MAP_BASE       ├─────────────────────────────────┤ 0xFFFF_8880_0000_0000
//!                       │  Direct map of physical memory  │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xFFFF_FFFF_8000_0000
//!                       │  Kernel text & data             │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All constants are validated with compile-time assertions so an
//! inconsistent layout fails the build instead of corrupting memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
