//! # Task descriptors
//!
//! A [`Task`] is one schedulable thread. Tasks sharing a [`SharedMemory`]
//! handle and a thread-group id form a process; the group leader's id is the
//! thread-group id.
//!
//! The immutable parts (id, home core) live directly in [`Task`]; everything
//! else sits behind the task's own lock in [`TaskInner`], which is always the
//! innermost lock taken.

use crate::cpu::CpuId;
use crate::descriptors::SharedDescriptors;
use crate::frame::TrapFrame;
use crate::stack::KernelStack;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use kernel_alloc::UserMemory;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinMutex;
use kernel_vmem::RootPage;

/// An address space shared by the threads of one process.
pub type SharedMemory = Arc<SpinMutex<UserMemory>>;

/// Task slot number. Slot 0 belongs to the boot context.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u32);

impl TaskId {
    /// The boot context; never a real task.
    pub const BOOT: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Unused -> Ready -> Running -> {Ready, Blocked, Terminated}`,
/// `Blocked -> Ready` on wake, `Terminated` until reaped.
///
/// `Unused` is not represented: an unused slot holds no task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// A signal number (1..=64).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Signal(u8);

impl Signal {
    pub const SIGKILL: Self = Self(9);
    pub const SIGSEGV: Self = Self(11);
    pub const SIGTERM: Self = Self(15);
    pub const SIGCHLD: Self = Self(17);

    #[must_use]
    pub const fn new(n: u8) -> Option<Self> {
        if matches!(n, 1..=64) { Some(Self(n)) } else { None }
    }

    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Exit status of a task killed by this signal.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn exit_code(self) -> i32 {
        128 + self.0 as i32
    }

    const fn bit(self) -> u64 {
        1 << (self.0 - 1)
    }
}

/// Pending-signal bitmask. Bit `n - 1` stands for signal `n`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SignalSet(u64);

impl SignalSet {
    pub const fn raise(&mut self, sig: Signal) {
        self.0 |= sig.bit();
    }

    #[must_use]
    pub const fn contains(self, sig: Signal) -> bool {
        self.0 & sig.bit() != 0
    }

    /// Remove and return the lowest pending signal.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn take(&mut self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        let n = self.0.trailing_zeros() as u8;
        self.0 &= !(1 << n);
        Some(Signal(n + 1))
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

/// Which children a `wait` accepts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitTarget {
    Any,
    Task(TaskId),
}

impl WaitTarget {
    #[must_use]
    pub fn matches(self, id: TaskId) -> bool {
        match self {
            Self::Any => true,
            Self::Task(t) => t == id,
        }
    }
}

/// A parent blocked in `wait`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct WaitRequest {
    pub target: WaitTarget,
    pub status_ptr: Option<VirtualAddress>,
}

pub struct Task {
    id: TaskId,
    cpu: CpuId,
    pub(crate) inner: SpinMutex<TaskInner>,
}

pub(crate) struct TaskInner {
    pub name: String,
    pub tgid: TaskId,
    pub parent: Option<TaskId>,
    pub state: TaskState,
    pub frame: TrapFrame,
    pub memory: Option<SharedMemory>,
    /// Root of `memory`, or `None` to run on the kernel root.
    pub root: Option<RootPage>,
    pub descriptors: Option<SharedDescriptors>,
    pub kernel_stack: Option<KernelStack>,
    /// Base of a stack carved from the thread-stack region.
    pub thread_stack: Option<VirtualAddress>,
    pub tls_base: u64,
    pub exit_code: i32,
    pub signals: SignalSet,
    pub waiting: Option<WaitRequest>,
    /// A child reaped on behalf of a blocked `wait`; delivered in `rax` when
    /// the parent next runs.
    pub wait_result: Option<(TaskId, i32)>,
    /// A wake arrived while the task was not blocked; the next block returns
    /// at once.
    pub wake_pending: bool,
    /// Resources have been released; the task is a zombie.
    pub finished: bool,
}

impl TaskInner {
    pub fn new(name: &str, tgid: TaskId, frame: TrapFrame) -> Self {
        Self {
            name: String::from(name),
            tgid,
            parent: None,
            state: TaskState::Ready,
            frame,
            memory: None,
            root: None,
            descriptors: None,
            kernel_stack: None,
            thread_stack: None,
            tls_base: 0,
            exit_code: 0,
            signals: SignalSet::default(),
            waiting: None,
            wait_result: None,
            wake_pending: false,
            finished: false,
        }
    }
}

impl TaskInner {
    /// Detach everything the task owns or shares.
    pub fn take_resources(&mut self) -> Resources {
        self.root = None;
        Resources {
            memory: self.memory.take(),
            descriptors: self.descriptors.take(),
            kernel_stack: self.kernel_stack.take(),
            thread_stack: self.thread_stack.take(),
        }
    }
}

/// What a dying task hands back.
pub(crate) struct Resources {
    pub memory: Option<SharedMemory>,
    pub descriptors: Option<SharedDescriptors>,
    pub kernel_stack: Option<KernelStack>,
    pub thread_stack: Option<VirtualAddress>,
}

impl Task {
    pub(crate) const fn new(id: TaskId, cpu: CpuId, inner: TaskInner) -> Self {
        Self {
            id,
            cpu,
            inner: SpinMutex::new(inner),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// The core this task was placed on. Tasks never migrate.
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.lock_irq().state
    }

    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.inner.lock_irq();
        TaskSnapshot {
            id: self.id,
            tgid: inner.tgid,
            parent: inner.parent,
            cpu: self.cpu,
            state: inner.state,
            name: inner.name.clone(),
            exit_code: inner.exit_code,
            pending_signals: inner.signals,
            tls_base: inner.tls_base,
            has_memory: inner.memory.is_some(),
        }
    }

    /// Whether this task is the leader of its thread group.
    pub(crate) fn is_leader(&self, inner: &TaskInner) -> bool {
        inner.tgid == self.id
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

/// A point-in-time copy of a task's bookkeeping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub tgid: TaskId,
    pub parent: Option<TaskId>,
    pub cpu: CpuId,
    pub state: TaskState,
    pub name: String,
    pub exit_code: i32,
    pub pending_signals: SignalSet,
    pub tls_base: u64,
    pub has_memory: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_are_taken_lowest_first() {
        let mut set = SignalSet::default();
        set.raise(Signal::SIGTERM);
        set.raise(Signal::SIGKILL);
        assert!(set.contains(Signal::SIGKILL));
        assert_eq!(set.bits(), (1 << 8) | (1 << 14));
        assert_eq!(set.take(), Some(Signal::SIGKILL));
        assert_eq!(set.take(), Some(Signal::SIGTERM));
        assert_eq!(set.take(), None);
        assert!(set.is_empty());
    }

    #[test]
    fn signal_numbers_are_bounded() {
        assert!(Signal::new(0).is_none());
        assert!(Signal::new(65).is_none());
        assert_eq!(Signal::new(64).map(Signal::number), Some(64));
        assert_eq!(Signal::SIGSEGV.exit_code(), 139);
    }
}
