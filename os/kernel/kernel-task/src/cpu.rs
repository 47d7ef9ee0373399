//! # Per-core state
//!
//! Every core owns a FIFO run queue behind its own ticket lock, the task it
//! is running, and a record of what it last loaded into the hardware: the
//! page-table root, the privileged stack pointer and the thread-local base.

use crate::frame::TrapFrame;
use crate::stack::KernelStack;
use crate::task::{Task, TaskId};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::{SpinMutex, TicketMutex};
use kernel_vmem::RootPage;

/// Logical core index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor.
    pub const BSP: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuId({})", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the trap layer resumes once a switch returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwitchOutcome {
    /// The interrupted task keeps running.
    Continued(TaskId),
    /// A different task was loaded.
    Switched(TaskId),
    /// Nothing is ready; the boot context resumes.
    Idle,
}

impl SwitchOutcome {
    /// The task now running, if any.
    #[must_use]
    pub const fn task(self) -> Option<TaskId> {
        match self {
            Self::Continued(id) | Self::Switched(id) => Some(id),
            Self::Idle => None,
        }
    }
}

pub(crate) struct RunQueue {
    pub ready: VecDeque<Arc<Task>>,
    pub current: Option<Arc<Task>>,
    /// Frame of the boot context, resumed while nothing is ready.
    pub idle_frame: TrapFrame,
}

pub struct Cpu {
    id: CpuId,
    pub(crate) queue: TicketMutex<RunQueue>,
    /// Kernel stack of a task that terminated here; released on the next
    /// switch, once execution has left it.
    pub(crate) retired_stack: SpinMutex<Option<KernelStack>>,
    loaded_root: AtomicU64,
    kernel_stack_top: AtomicU64,
    tls_base: AtomicU64,
    switches: AtomicU64,
}

impl Cpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            queue: TicketMutex::new(RunQueue {
                ready: VecDeque::new(),
                current: None,
                idle_frame: TrapFrame::default(),
            }),
            retired_stack: SpinMutex::new(None),
            loaded_root: AtomicU64::new(0),
            kernel_stack_top: AtomicU64::new(0),
            tls_base: AtomicU64::new(0),
            switches: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Page-table root loaded by the last switch; `None` before the first.
    #[must_use]
    pub fn loaded_root(&self) -> Option<RootPage> {
        match self.loaded_root.load(Ordering::Acquire) {
            0 => None,
            pa => Some(PhysicalPage::containing(PhysicalAddress::new(pa))),
        }
    }

    pub(crate) fn set_loaded_root(&self, root: RootPage) {
        self.loaded_root.store(root.base().as_u64(), Ordering::Release);
    }

    /// Privileged stack pointer used on the next ring 3 → ring 0 transition.
    #[must_use]
    pub fn kernel_stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.kernel_stack_top.load(Ordering::Relaxed))
    }

    pub(crate) fn set_kernel_stack_top(&self, top: VirtualAddress) {
        self.kernel_stack_top.store(top.as_u64(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn tls_base(&self) -> u64 {
        self.tls_base.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tls_base(&self, base: u64) {
        self.tls_base.store(base, Ordering::Relaxed);
    }

    /// Number of completed switch decisions.
    #[must_use]
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub(crate) fn count_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// The running task, if any.
    #[must_use]
    pub fn current(&self) -> Option<TaskId> {
        self.queue.lock_irq().current.as_ref().map(|t| t.id())
    }

    /// Ready tasks in queue order.
    #[must_use]
    pub fn ready(&self) -> alloc::vec::Vec<TaskId> {
        self.queue.lock_irq().ready.iter().map(|t| t.id()).collect()
    }
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("loaded_root", &self.loaded_root())
            .field("switches", &self.switches())
            .finish_non_exhaustive()
    }
}
