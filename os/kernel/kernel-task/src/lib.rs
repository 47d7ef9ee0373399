//! # Tasks, Scheduling and Process Lifecycle
//!
//! The part of the kernel that decides what runs where, and in which address
//! space.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Kernel                              │
//! │  lifecycle: create · fork · spawn_thread · exec · exit · wait│
//! │  memory:    page faults · map/unmap · mmap · brk · copies    │
//! │  sched:     switch · yield · block/unblock                   │
//! └───────┬──────────────────────┬───────────────────────┬───────┘
//!         │                      │                       │
//!   task table (slots)     per-core run queues     frame allocator
//!         │                      │                       │
//!      Task ── inner ── SharedMemory (UserMemory) ── page tables
//! ```
//!
//! ## Entry points
//!
//! Trap handlers call into [`Kernel`] with the [`CpuId`] they run on and the
//! saved [`TrapFrame`]. Calls that may switch tasks rewrite the frame in
//! place; the trap stub restores whatever it holds afterwards. Hardware
//! state beyond the frame (CR3, `TSS.RSP0`, FS base) goes through the
//! [`CoreHardware`] adapter of that core.
//!
//! ## Hosted tests
//!
//! Nothing here touches hardware directly. The integration tests run the
//! whole core on the host with `kernel_alloc::hosted` RAM and a software
//! [`CoreHardware`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod arch;
mod cpu;
pub mod descriptors;
mod error;
pub mod exec;
mod frame;
pub mod image;
mod kernel;
mod lifecycle;
mod memory;
mod sched;
mod stack;
mod table;
mod task;

pub use crate::arch::CoreHardware;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::arch::{X86, X86Mmu};
pub use crate::cpu::{Cpu, CpuId, SwitchOutcome};
pub use crate::descriptors::{DescriptorFlags, DescriptorTable, Handle, SharedDescriptors};
pub use crate::error::TaskError;
pub use crate::frame::{TrapFrame, selectors};
pub use crate::image::{ElfLoader, Image, ImageError, ImageLoader};
pub use crate::kernel::Kernel;
pub use crate::lifecycle::{WaitOptions, WaitOutcome};
pub use crate::memory::FaultOutcome;
pub use crate::sched::wait_status;
pub use crate::task::{
    SharedMemory, Signal, SignalSet, Task, TaskId, TaskSnapshot, TaskState, WaitTarget,
};
