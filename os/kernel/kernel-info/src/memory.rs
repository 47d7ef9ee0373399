//! # Memory Layout

pub use kernel_memory_addresses::{KERNEL_HALF_START, PAGE_SIZE, USER_HALF_END};

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`DIRECT_MAP_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
///
/// This is the default; the boot handoff may supply a different offset.
pub const DIRECT_MAP_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Top of the main user stack (exclusive).
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Size of the main user stack VMA.
pub const USER_STACK_SIZE: u64 = 1024 * 1024;

/// Number of pages at the top of the main stack that are populated eagerly.
///
/// The rest of the stack VMA is demand-paged.
pub const USER_STACK_EAGER_PAGES: u64 = 4;

/// Upper bound of the `mmap` region; free ranges are searched downward from here.
pub const MMAP_BASE: u64 = 0x0000_7ff0_0000_0000;

/// Lowest address of the thread-stack region.
pub const THREAD_STACK_BASE: u64 = MMAP_BASE;

/// End of the thread-stack region (exclusive).
pub const THREAD_STACK_END: u64 = 0x0000_7ff8_0000_0000;

/// Size of a thread-stack slot. The lowest page of every slot stays unmapped as a guard.
pub const THREAD_STACK_SLOT: u64 = 256 * 1024;

/// Size of the dedicated privileged-mode stack of every task.
pub const TASK_KERNEL_STACK_SIZE: u64 = 16 * 1024;

/// Upper bound for the bytes of argument and environment strings passed to `exec`.
pub const ARG_MAX: usize = 128 * 1024;

/// Number of task slots, including the reserved boot slot 0.
pub const MAX_TASKS: usize = 128;

/// Maximum number of processor cores.
pub const MAX_CPUS: usize = 32;

const _: () = {
    assert!(TASK_KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(THREAD_STACK_SLOT.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_TOP.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_EAGER_PAGES * PAGE_SIZE <= USER_STACK_SIZE);
    assert!(USER_STACK_TOP < USER_HALF_END);
    assert!(THREAD_STACK_END <= USER_STACK_TOP - USER_STACK_SIZE);
    assert!(THREAD_STACK_BASE < THREAD_STACK_END);
    assert!(DIRECT_MAP_BASE >= KERNEL_HALF_START);
    assert!(KERNEL_BASE > DIRECT_MAP_BASE);
    assert!(ARG_MAX < (USER_STACK_SIZE as usize));
};
