//! # Per-core scheduling
//!
//! Every trap that may switch tasks ends in [`Kernel::switch`] with the
//! interrupted register frame. The frame is stored in the outgoing task,
//! the head of the core's ready queue is promoted to `Running` and its frame
//! is copied back for the trap stub to restore.
//!
//! Tasks never migrate: a task is woken onto the queue of the core it was
//! created on. A task found `Terminated` (by itself or by another core) is
//! cleaned up here, after the switch has left its address space.

use crate::arch::CoreHardware;
use crate::cpu::{Cpu, CpuId, SwitchOutcome};
use crate::error::TaskError;
use crate::frame::TrapFrame;
use crate::kernel::Kernel;
use crate::stack::KernelStack;
use crate::table::TaskTable;
use crate::task::{Resources, SharedMemory, Signal, Task, TaskId, TaskState};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{PAGE_SIZE, THREAD_STACK_SLOT};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PhysMapper, RootPage};
use log::{debug, info, trace, warn};

/// What the outgoing task wants.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Transition {
    /// Stay runnable.
    Yield,
    /// Sleep until woken.
    Block,
}

/// What a core must load for the incoming context.
struct Load {
    root: RootPage,
    stack: Option<VirtualAddress>,
    tls: Option<u64>,
}

/// Status word reported by `wait` for an exit code.
#[must_use]
pub const fn wait_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

impl<M: PhysMapper, H: CoreHardware> Kernel<M, H> {
    /// Trap-driven switch: the running task goes to the back of the queue
    /// and the head runs next.
    ///
    /// # Errors
    /// [`TaskError::NoSuchCpu`].
    pub fn switch(&self, cpu: CpuId, frame: &mut TrapFrame) -> Result<SwitchOutcome, TaskError> {
        self.reschedule(cpu, frame, Transition::Yield)
    }

    /// Voluntary yield; same as [`switch`](Self::switch).
    ///
    /// # Errors
    /// [`TaskError::NoSuchCpu`].
    pub fn yield_now(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
    ) -> Result<SwitchOutcome, TaskError> {
        self.reschedule(cpu, frame, Transition::Yield)
    }

    /// Put the running task to sleep until [`unblock`](Self::unblock).
    ///
    /// A wake that arrived since the task last slept makes this return
    /// without sleeping.
    ///
    /// # Errors
    /// [`TaskError::NoSuchCpu`].
    pub fn block(&self, cpu: CpuId, frame: &mut TrapFrame) -> Result<SwitchOutcome, TaskError> {
        self.reschedule(cpu, frame, Transition::Block)
    }

    /// Make a blocked task runnable on its own core.
    ///
    /// Returns whether it was blocked. Waking a task that is running or
    /// ready is remembered for its next [`block`](Self::block).
    ///
    /// # Errors
    /// [`TaskError::NoSuchTask`].
    pub fn unblock(&self, id: TaskId) -> Result<bool, TaskError> {
        let task = self.lookup(id)?;
        self.wake(&task)
    }

    pub(crate) fn wake(&self, task: &Arc<Task>) -> Result<bool, TaskError> {
        let mut queue = self.cpu(task.cpu())?.queue.lock_irq();
        let mut inner = task.inner.lock_irq();
        match inner.state {
            TaskState::Blocked => {
                inner.state = TaskState::Ready;
                drop(inner);
                queue.ready.push_back(Arc::clone(task));
                trace!("woke task {}", task.id());
                Ok(true)
            }
            TaskState::Terminated => Ok(false),
            TaskState::Ready | TaskState::Running => {
                inner.wake_pending = true;
                Ok(false)
            }
        }
    }

    /// Force `task` to `Terminated` with `code`.
    ///
    /// It is cleaned up the next time its core schedules. A blocked task is
    /// put back on its queue for that. Returns `false` if it was already
    /// terminated.
    pub(crate) fn terminate(&self, task: &Arc<Task>, code: i32) -> Result<bool, TaskError> {
        let mut queue = self.cpu(task.cpu())?.queue.lock_irq();
        let mut inner = task.inner.lock_irq();
        let was = inner.state;
        if was == TaskState::Terminated {
            return Ok(false);
        }
        inner.state = TaskState::Terminated;
        inner.exit_code = code;
        inner.waiting = None;
        drop(inner);
        if was == TaskState::Blocked {
            queue.ready.push_back(Arc::clone(task));
        }
        debug!("task {} terminated ({code}), was {was:?}", task.id());
        Ok(true)
    }

    pub(crate) fn reschedule(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
        how: Transition,
    ) -> Result<SwitchOutcome, TaskError> {
        let core = self.cpu(cpu)?;

        // The previous switch left the stack it ran on.
        let retired = core.retired_stack.lock_irq().take();
        if let Some(stack) = retired {
            stack.release(&mut self.frames.lock_irq());
        }

        let mut dead = Vec::new();
        let (outcome, load) = {
            let mut queue = core.queue.lock_irq();
            let prev = queue.current.take();

            match &prev {
                Some(prev) => {
                    let mut inner = prev.inner.lock_irq();
                    inner.frame = frame.clone();
                    if inner.state == TaskState::Terminated {
                        drop(inner);
                        dead.push((Arc::clone(prev), true));
                    } else if how == Transition::Block && !core::mem::take(&mut inner.wake_pending) {
                        inner.state = TaskState::Blocked;
                    } else {
                        inner.state = TaskState::Ready;
                        drop(inner);
                        queue.ready.push_back(Arc::clone(prev));
                    }
                }
                None => queue.idle_frame = frame.clone(),
            }

            let next = loop {
                let Some(task) = queue.ready.pop_front() else {
                    break None;
                };
                let mut inner = task.inner.lock_irq();
                if inner.state == TaskState::Terminated {
                    drop(inner);
                    dead.push((task, false));
                    continue;
                }
                inner.state = TaskState::Running;
                if let Some((child, _)) = inner.wait_result.take() {
                    inner.frame.set_return(u64::from(child.as_u32()));
                }
                *frame = inner.frame.clone();
                let load = Load {
                    root: inner.root.unwrap_or(self.kernel_root()),
                    stack: inner.kernel_stack.as_ref().map(KernelStack::top),
                    tls: Some(inner.tls_base),
                };
                drop(inner);
                break Some((task, load));
            };

            let outcome = match (&prev, &next) {
                (_, None) => SwitchOutcome::Idle,
                (Some(p), Some((n, _))) if p.id() == n.id() => SwitchOutcome::Continued(n.id()),
                (_, Some((n, _))) => SwitchOutcome::Switched(n.id()),
            };
            let load = match next {
                Some((task, load)) => {
                    queue.current = Some(task);
                    load
                }
                None => {
                    *frame = queue.idle_frame.clone();
                    Load {
                        root: self.kernel_root(),
                        stack: None,
                        tls: None,
                    }
                }
            };
            (outcome, load)
        };

        if core.loaded_root() != Some(load.root) {
            self.hw.mmu(cpu).activate(load.root);
            core.set_loaded_root(load.root);
        }
        if let Some(top) = load.stack {
            self.hw.set_kernel_stack(cpu, top);
            core.set_kernel_stack_top(top);
        }
        if let Some(tls) = load.tls {
            self.hw.set_thread_pointer(cpu, tls);
            core.set_tls_base(tls);
        }
        core.count_switch();
        trace!("core {cpu}: {outcome:?}");

        for (task, on_stack) in dead {
            self.finish(core, &task, on_stack);
        }
        Ok(outcome)
    }

    /// Release what a terminated task holds and report it to its parent.
    pub(crate) fn finish(&self, core: &Cpu, task: &Arc<Task>, on_stack: bool) {
        let (resources, code) = {
            let mut inner = task.inner.lock_irq();
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.waiting = None;
            (inner.take_resources(), inner.exit_code)
        };

        self.release(core, task.id(), resources, on_stack);
        info!("task {} exited with status {code}", task.id());

        self.settle(core, task);
    }

    /// Free a task's kernel stack and thread stack and drop its handles on
    /// shared state.
    ///
    /// `on_stack`: the calling core still runs on that kernel stack, which is
    /// therefore retired until the core's next switch.
    pub(crate) fn release(&self, core: &Cpu, id: TaskId, resources: Resources, on_stack: bool) {
        if let Some(stack) = resources.kernel_stack {
            let stack = if on_stack {
                core.retired_stack.lock_irq().replace(stack)
            } else {
                Some(stack)
            };
            if let Some(stack) = stack {
                stack.release(&mut self.frames.lock_irq());
            }
        }
        if let (Some(base), Some(memory)) = (resources.thread_stack, &resources.memory) {
            let mut mem = memory.lock_irq();
            let len = THREAD_STACK_SLOT - PAGE_SIZE;
            let mmu = self.hw.mmu(core.id());
            if let Err(e) = mem.munmap(&self.mapper, &mut *self.frames.lock_irq(), mmu, base, len) {
                warn!("thread stack at {base} of task {id} not released: {e}");
            }
        }
        if let Some(memory) = resources.memory {
            self.release_memory(memory);
        }
        drop(resources.descriptors);
    }

    /// Drop one handle on an address space; the last one destroys it.
    pub(crate) fn release_memory(&self, memory: SharedMemory) {
        if let Some(memory) = Arc::into_inner(memory) {
            memory
                .into_inner()
                .destroy(&self.mapper, &mut *self.frames.lock_irq());
        }
    }

    /// Table bookkeeping for a task that just finished.
    ///
    /// The process ends with the last task of its group: only then are its
    /// children orphaned and its parent told.
    fn settle(&self, core: &Cpu, task: &Arc<Task>) {
        let mut table = self.tasks.lock_irq();
        let id = task.id();
        let tgid = task.inner.lock_irq().tgid;

        let leader = if tgid == id {
            Arc::clone(task)
        } else {
            // Threads are never waited for.
            table.remove(id);
            let Some(leader) = table.get(tgid).cloned() else {
                return;
            };
            leader
        };
        let finished = leader.inner.lock_irq().finished;
        if !finished || !group_done(&table, tgid) {
            return;
        }

        orphan_children(&mut table, tgid);
        self.notify_parent(core, &mut table, &leader);
    }

    /// `leader`'s whole group is gone: hand its status to a waiting parent
    /// or leave it as a zombie. Without a parent it is reaped at once.
    fn notify_parent(&self, core: &Cpu, table: &mut TaskTable, leader: &Arc<Task>) {
        let child = leader.id();
        let (parent, code) = {
            let inner = leader.inner.lock_irq();
            (inner.parent, inner.exit_code)
        };
        let Some(parent) = parent else {
            table.remove(child);
            trace!("reaped orphan {child}");
            return;
        };

        if let Some(p) = table.get(parent) {
            p.inner.lock_irq().signals.raise(Signal::SIGCHLD);
        }

        let waiter = table
            .iter()
            .find(|t| {
                let inner = t.inner.lock_irq();
                inner.tgid == parent && inner.waiting.is_some_and(|w| w.target.matches(child))
            })
            .cloned();
        let Some(waiter) = waiter else {
            debug!("task {child} is a zombie until {parent} waits");
            return;
        };

        let status = wait_status(code);
        let (request, memory) = {
            let mut inner = waiter.inner.lock_irq();
            inner.wait_result = Some((child, status));
            (inner.waiting.take(), inner.memory.clone())
        };
        if let (Some(ptr), Some(memory)) = (request.and_then(|r| r.status_ptr), memory) {
            let written = memory.lock_irq().copy_to_user(
                &self.mapper,
                &mut *self.frames.lock_irq(),
                self.hw.mmu(core.id()),
                ptr,
                &status.to_le_bytes(),
            );
            if let Err(e) = written {
                warn!("wait status for {} not stored at {ptr}: {e}", waiter.id());
            }
        }
        table.remove(child);
        if let Err(e) = self.wake(&waiter) {
            warn!("waiter {} not woken: {e}", waiter.id());
        }
        debug!("task {child} reaped by {}", waiter.id());
    }
}

/// Detach the children of process `tgid`; those already gone are reaped.
fn orphan_children(table: &mut TaskTable, tgid: TaskId) {
    let mut reap = Vec::new();
    for child in table.iter() {
        let mut inner = child.inner.lock_irq();
        if inner.parent == Some(tgid) {
            inner.parent = None;
            if inner.finished {
                reap.push(child.id());
            }
        }
    }
    for child in reap {
        if group_done(table, child) {
            table.remove(child);
            trace!("reaped orphan {child}");
        }
    }
}

/// No member of group `tgid` other than the leader is left.
pub(crate) fn group_done(table: &TaskTable, tgid: TaskId) -> bool {
    !table
        .iter()
        .any(|t| t.id() != tgid && t.inner.lock_irq().tgid == tgid)
}
