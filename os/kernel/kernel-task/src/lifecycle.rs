//! # Task lifecycle
//!
//! Creation (`create`, `create_user`, `fork`, `spawn_thread`), image
//! replacement (`exec`) and the way out (`exit`, `exit_group`, `kill`,
//! `wait`).
//!
//! Everything a new task needs is built before a slot is claimed, and every
//! failure path gives back what was built. A process is a thread group: the
//! leader's id is the group id, the group shares one [`SharedMemory`] and one
//! descriptor table, and only the leader ever has a parent.

use crate::arch::CoreHardware;
use crate::cpu::{CpuId, SwitchOutcome};
use crate::descriptors::{DescriptorTable, SharedDescriptors};
use crate::error::TaskError;
use crate::exec::{EntryInfo, initial_stack};
use crate::frame::TrapFrame;
use crate::image::{Image, ImageError, ImageLoader};
use crate::kernel::Kernel;
use crate::sched::{Transition, group_done, wait_status};
use crate::stack::KernelStack;
use crate::task::{
    SharedMemory, Signal, Task, TaskId, TaskInner, TaskState, WaitRequest, WaitTarget,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{BitmapFrameAlloc, UserMemory, VmmError};
use kernel_info::memory::{
    PAGE_SIZE, THREAD_STACK_BASE, THREAD_STACK_END, THREAD_STACK_SLOT, USER_STACK_EAGER_PAGES,
    USER_STACK_SIZE, USER_STACK_TOP,
};
use kernel_memory_addresses::{VirtualAddress, checked_align_up};
use kernel_sync::SpinMutex;
use kernel_vmem::{Mmu, PhysMapper, Vma, VmaError, VmaFlags};
use log::{debug, info, warn};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct WaitOptions: u32 {
        /// Return at once if no child has exited yet.
        const NOHANG = 1 << 0;
    }
}

/// How a `wait` ended for now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// A zombie was reaped; its id is also in the caller's `rax`.
    Reaped { child: TaskId, status: i32 },
    /// `NOHANG` and every matching child is still alive; `rax` is 0.
    NoZombie,
    /// The caller sleeps. The child id arrives in its `rax` when it runs
    /// again.
    Blocked(SwitchOutcome),
}

impl<M: PhysMapper, H: CoreHardware> Kernel<M, H> {
    /// A task running privileged code at `entry` on its own kernel stack.
    ///
    /// # Errors
    /// [`TaskError::OutOfMemory`], [`TaskError::NoFreeSlot`].
    pub fn create(&self, name: &str, entry: VirtualAddress) -> Result<TaskId, TaskError> {
        let stack = KernelStack::allocate(&mut self.frames.lock_irq(), &self.mapper)?;
        let mut inner = TaskInner::new(name, TaskId::BOOT, TrapFrame::kernel(entry, stack.top()));
        inner.kernel_stack = Some(stack);
        let id = self.admit(CpuId::BSP, inner, None)?;
        info!("created kernel task {id} '{name}' at {entry}");
        Ok(id)
    }

    /// A new process running the program in `bytes`, without a parent.
    ///
    /// # Errors
    /// [`TaskError::Image`] for images the loader refuses,
    /// [`TaskError::ArgumentsTooLarge`], [`TaskError::OutOfMemory`],
    /// [`TaskError::Memory`] for segments that overlap each other,
    /// [`TaskError::NoFreeSlot`].
    pub fn create_user(
        &self,
        loader: &impl ImageLoader,
        bytes: &[u8],
        argv: &[&str],
        envp: &[&str],
    ) -> Result<TaskId, TaskError> {
        let image = loader.parse(bytes)?;
        let (memory, frame) = self.build_user(&image, argv, envp)?;
        let stack = match KernelStack::allocate(&mut self.frames.lock_irq(), &self.mapper) {
            Ok(stack) => stack,
            Err(e) => {
                memory.destroy(&self.mapper, &mut *self.frames.lock_irq());
                return Err(e.into());
            }
        };

        let name = argv.first().copied().unwrap_or("user");
        let mut inner = TaskInner::new(name, TaskId::BOOT, frame);
        inner.root = Some(memory.root());
        inner.memory = Some(Arc::new(SpinMutex::new(memory)));
        inner.descriptors = Some(Arc::new(SpinMutex::new(DescriptorTable::new())));
        inner.kernel_stack = Some(stack);
        let id = self.admit(CpuId::BSP, inner, None)?;
        info!("created user task {id} '{name}' at {}", image.entry);
        Ok(id)
    }

    /// Copy the calling process.
    ///
    /// The child gets a copy-on-write clone of the address space, a copy of
    /// the descriptor table and `frame` with `rax = 0`. The caller's `rax`
    /// becomes the child id. Only the calling thread is copied.
    ///
    /// # Errors
    /// [`TaskError::NotUserTask`] for tasks without an address space,
    /// [`TaskError::Memory`] / [`TaskError::OutOfMemory`] (nothing leaks),
    /// [`TaskError::NoFreeSlot`].
    pub fn fork(&self, cpu: CpuId, frame: &mut TrapFrame) -> Result<TaskId, TaskError> {
        let parent = self.current_task(cpu)?;
        let (memory, descriptors, name, tls, tgid) = {
            let inner = parent.inner.lock_irq();
            let memory = inner
                .memory
                .clone()
                .ok_or(TaskError::NotUserTask(parent.id()))?;
            (
                memory,
                inner.descriptors.clone(),
                inner.name.clone(),
                inner.tls_base,
                inner.tgid,
            )
        };

        let copy = {
            let memory = memory.lock_irq();
            memory.fork(&self.mapper, &mut *self.frames.lock_irq(), self.hw.mmu(cpu))?
        };
        let stack = match KernelStack::allocate(&mut self.frames.lock_irq(), &self.mapper) {
            Ok(stack) => stack,
            Err(e) => {
                copy.destroy(&self.mapper, &mut *self.frames.lock_irq());
                return Err(e.into());
            }
        };

        let mut child_frame = frame.clone();
        child_frame.set_return(0);
        let table = descriptors.map_or_else(DescriptorTable::new, |d| d.lock_irq().clone());

        let mut inner = TaskInner::new(&name, TaskId::BOOT, child_frame);
        inner.parent = Some(tgid);
        inner.root = Some(copy.root());
        inner.memory = Some(Arc::new(SpinMutex::new(copy)));
        inner.descriptors = Some(Arc::new(SpinMutex::new(table)));
        inner.kernel_stack = Some(stack);
        inner.tls_base = tls;
        let child = self.admit(cpu, inner, None)?;

        frame.set_return(u64::from(child.as_u32()));
        info!("task {} forked {child}", parent.id());
        Ok(child)
    }

    /// A new thread in the caller's group, entering user code at `entry`
    /// with `arg` in `rdi`.
    ///
    /// Without a `stack` top, a stack slot is carved from the thread-stack
    /// region; its lowest page stays unmapped as a guard and its top page is
    /// populated. Such a stack is unmapped when the thread ends.
    ///
    /// # Errors
    /// [`TaskError::NotUserTask`], [`TaskError::NoThreadStack`],
    /// [`TaskError::OutOfMemory`], [`TaskError::NoFreeSlot`].
    pub fn spawn_thread(
        &self,
        cpu: CpuId,
        entry: VirtualAddress,
        stack: Option<VirtualAddress>,
        arg: u64,
    ) -> Result<TaskId, TaskError> {
        let caller = self.current_task(cpu)?;
        let (memory, root, descriptors, name, tgid) = {
            let inner = caller.inner.lock_irq();
            let memory = inner
                .memory
                .clone()
                .ok_or(TaskError::NotUserTask(caller.id()))?;
            (
                memory,
                inner.root,
                inner.descriptors.clone(),
                inner.name.clone(),
                inner.tgid,
            )
        };

        let (top, carved) = match stack {
            Some(top) => (top, None),
            None => {
                let base = self.carve_thread_stack(cpu, &memory)?;
                let top = VirtualAddress::new(base.as_u64() + THREAD_STACK_SLOT - PAGE_SIZE);
                (top, Some(base))
            }
        };

        let kernel_stack = match KernelStack::allocate(&mut self.frames.lock_irq(), &self.mapper) {
            Ok(stack) => stack,
            Err(e) => {
                if let Some(base) = carved {
                    self.drop_thread_stack(cpu, &memory, base);
                }
                return Err(e.into());
            }
        };

        // Function-entry alignment: `rsp + 8` is a multiple of 16.
        let sp = if carved.is_some() {
            VirtualAddress::new(top.as_u64() - 8)
        } else {
            top
        };
        let mut frame = TrapFrame::user(entry, sp);
        frame.rdi = arg;

        let mut inner = TaskInner::new(&name, tgid, frame);
        inner.memory = Some(memory);
        inner.root = root;
        inner.descriptors = descriptors;
        inner.kernel_stack = Some(kernel_stack);
        inner.thread_stack = carved;
        let id = self.admit(cpu, inner, Some(tgid))?;
        info!("task {} spawned thread {id} at {entry}, stack {sp}", caller.id());
        Ok(id)
    }

    /// Replace the caller's program with the one in `bytes`.
    ///
    /// The new address space is complete before anything else changes, so a
    /// failure leaves the caller as it was. On success the other threads of
    /// the group are terminated, the caller becomes the group leader,
    /// close-on-exec descriptors are closed and `frame` enters the new
    /// program.
    ///
    /// # Errors
    /// As [`create_user`](Self::create_user).
    pub fn exec(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
        loader: &impl ImageLoader,
        bytes: &[u8],
        argv: &[&str],
        envp: &[&str],
    ) -> Result<(), TaskError> {
        let task = self.current_task(cpu)?;
        let image = loader.parse(bytes)?;
        let (memory, entry_frame) = self.build_user(&image, argv, envp)?;
        let root = memory.root();
        let id = task.id();

        if let Err(e) = self.take_over_group(&task) {
            memory.destroy(&self.mapper, &mut *self.frames.lock_irq());
            return Err(e);
        }

        let (old_memory, descriptors) = {
            let mut inner = task.inner.lock_irq();
            if let Some(name) = argv.first() {
                inner.name = (*name).into();
            }
            inner.root = Some(root);
            inner.thread_stack = None;
            inner.tls_base = 0;
            (
                inner.memory.replace(Arc::new(SpinMutex::new(memory))),
                inner.descriptors.take(),
            )
        };

        let core = self.cpu(cpu)?;
        self.hw.mmu(cpu).activate(root);
        core.set_loaded_root(root);
        self.hw.set_thread_pointer(cpu, 0);
        core.set_tls_base(0);
        if let Some(old) = old_memory {
            self.release_memory(old);
        }

        let mut table = descriptors.map_or_else(DescriptorTable::new, |d| d.lock_irq().clone());
        let closed = table.close_on_exec();
        task.inner.lock_irq().descriptors = Some(Arc::new(SpinMutex::new(table)));

        *frame = entry_frame;
        info!(
            "task {id} exec'd '{}' at {}, {} descriptors closed",
            argv.first().copied().unwrap_or(""),
            image.entry,
            closed.len()
        );
        Ok(())
    }

    /// Terminate the calling task with `code` and switch away.
    ///
    /// # Errors
    /// [`TaskError::NoCurrentTask`].
    pub fn exit(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
        code: i32,
    ) -> Result<SwitchOutcome, TaskError> {
        let task = self.current_task(cpu)?;
        self.terminate(&task, code)?;
        self.reschedule(cpu, frame, Transition::Yield)
    }

    /// Terminate every thread of the caller's group with `code` and switch
    /// away.
    ///
    /// # Errors
    /// [`TaskError::NoCurrentTask`].
    pub fn exit_group(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
        code: i32,
    ) -> Result<SwitchOutcome, TaskError> {
        let task = self.current_task(cpu)?;
        let tgid = task.inner.lock_irq().tgid;
        for member in self.members(tgid) {
            if member.id() != task.id() {
                self.terminate(&member, code)?;
            }
        }
        self.exit(cpu, frame, code)
    }

    /// Force the process containing task `id` to exit with the status of
    /// `signal`.
    ///
    /// Tasks running on other cores stop at their next switch. Returns
    /// `false` if the task was already terminated.
    ///
    /// # Errors
    /// [`TaskError::NoSuchTask`].
    pub fn kill(&self, id: TaskId, signal: Signal) -> Result<bool, TaskError> {
        let task = self.lookup(id)?;
        let tgid = task.inner.lock_irq().tgid;
        let code = signal.exit_code();
        let mut killed = false;
        for member in self.members(tgid) {
            let hit = self.terminate(&member, code)?;
            if member.id() == id {
                killed = hit;
            }
        }
        if killed {
            info!("task {id} killed by signal {}", signal.number());
        }
        Ok(killed)
    }

    /// Mark `signal` pending on task `id`.
    ///
    /// # Errors
    /// [`TaskError::NoSuchTask`].
    pub fn raise_signal(&self, id: TaskId, signal: Signal) -> Result<(), TaskError> {
        self.lookup(id)?.inner.lock_irq().signals.raise(signal);
        Ok(())
    }

    /// Remove the lowest pending signal of the task running on `cpu`.
    ///
    /// # Errors
    /// [`TaskError::NoCurrentTask`].
    pub fn take_signal(&self, cpu: CpuId) -> Result<Option<Signal>, TaskError> {
        Ok(self.current_task(cpu)?.inner.lock_irq().signals.take())
    }

    /// Reap a child process of the caller matching `target`.
    ///
    /// A child counts as exited once its whole thread group is gone. With a
    /// `status_ptr`, the [`wait_status`] word is stored there in the caller's
    /// address space.
    ///
    /// # Errors
    /// [`TaskError::NoChildren`] if no child matches.
    pub fn wait(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
        target: WaitTarget,
        options: WaitOptions,
        status_ptr: Option<VirtualAddress>,
    ) -> Result<WaitOutcome, TaskError> {
        let caller = self.current_task(cpu)?;
        let group = caller.inner.lock_irq().tgid;

        let reaped = {
            let mut table = self.tasks.lock_irq();
            let children: Vec<(TaskId, bool, i32)> = table
                .iter()
                .filter(|t| target.matches(t.id()))
                .filter_map(|t| {
                    let inner = t.inner.lock_irq();
                    (inner.parent == Some(group)).then_some((t.id(), inner.finished, inner.exit_code))
                })
                .collect();
            if children.is_empty() {
                return Err(TaskError::NoChildren);
            }

            let zombie = children
                .iter()
                .find(|(child, finished, _)| *finished && group_done(&table, *child))
                .copied();
            match zombie {
                Some((child, _, code)) => {
                    table.remove(child);
                    Some((child, wait_status(code)))
                }
                None if options.contains(WaitOptions::NOHANG) => None,
                None => {
                    let mut inner = caller.inner.lock_irq();
                    inner.waiting = Some(WaitRequest { target, status_ptr });
                    inner.wake_pending = false;
                    drop(inner);
                    drop(table);
                    debug!("task {} waits for {target:?}", caller.id());
                    return Ok(WaitOutcome::Blocked(self.block(cpu, frame)?));
                }
            }
        };

        let Some((child, status)) = reaped else {
            frame.set_return(0);
            return Ok(WaitOutcome::NoZombie);
        };
        if let Some(ptr) = status_ptr {
            self.store_status(cpu, &caller, ptr, status);
        }
        frame.set_return(u64::from(child.as_u32()));
        debug!("task {} reaped {child} (status {status:#x})", caller.id());
        Ok(WaitOutcome::Reaped { child, status })
    }

    /// Descriptor table of task `id`.
    #[must_use]
    pub fn descriptors(&self, id: TaskId) -> Option<SharedDescriptors> {
        let task = self.tasks.lock_irq().get(id).cloned()?;
        task.inner.lock_irq().descriptors.clone()
    }

    /// Claim a slot for `inner` and queue it on its core.
    ///
    /// `group` is the thread group to join; `None` starts a new one led by
    /// the new task. Without a free slot everything `inner` holds is given
    /// back.
    fn admit(
        &self,
        cpu: CpuId,
        mut inner: TaskInner,
        group: Option<TaskId>,
    ) -> Result<TaskId, TaskError> {
        let mut table = self.tasks.lock_irq();
        let Some(id) = table.free_slot() else {
            drop(table);
            warn!("task table full, '{}' not created", inner.name);
            let resources = inner.take_resources();
            self.release(self.cpu(cpu)?, TaskId::BOOT, resources, false);
            return Err(TaskError::NoFreeSlot);
        };
        inner.tgid = group.unwrap_or(id);
        inner.state = TaskState::Ready;
        let task = Arc::new(Task::new(id, self.place(), inner));
        table.insert(Arc::clone(&task));
        self.enqueue(&task)?;
        debug!("task {id} admitted on core {}", task.cpu());
        Ok(id)
    }

    /// Every task of group `tgid`, leader included.
    fn members(&self, tgid: TaskId) -> Vec<Arc<Task>> {
        self.tasks
            .lock_irq()
            .iter()
            .filter(|t| t.inner.lock_irq().tgid == tgid)
            .cloned()
            .collect()
    }

    /// Terminate the other threads of `task`'s group and make `task` its
    /// leader.
    ///
    /// A non-leader takes over the leader's parent and children; the old
    /// leader is left to be reaped silently.
    fn take_over_group(&self, task: &Arc<Task>) -> Result<(), TaskError> {
        let id = task.id();
        let mut table = self.tasks.lock_irq();
        let tgid = task.inner.lock_irq().tgid;

        let others: Vec<Arc<Task>> = table
            .iter()
            .filter(|t| t.id() != id && t.inner.lock_irq().tgid == tgid)
            .cloned()
            .collect();
        for other in &others {
            self.terminate(other, 0)?;
        }
        if tgid == id {
            return Ok(());
        }

        let parent = table
            .get(tgid)
            .and_then(|leader| leader.inner.lock_irq().parent.take());
        for t in table.iter() {
            let mut inner = t.inner.lock_irq();
            if inner.parent == Some(tgid) {
                inner.parent = Some(id);
            }
        }
        {
            let mut inner = task.inner.lock_irq();
            inner.tgid = id;
            inner.parent = parent;
        }

        let stale = table
            .get(tgid)
            .is_some_and(|leader| leader.inner.lock_irq().finished);
        if stale && group_done(&table, tgid) {
            table.remove(tgid);
        }
        debug!("task {id} took over group {tgid}");
        Ok(())
    }

    /// Address space, registers and initial stack for a fresh program.
    fn build_user(
        &self,
        image: &Image<'_>,
        argv: &[&str],
        envp: &[&str],
    ) -> Result<(UserMemory, TrapFrame), TaskError> {
        let top = VirtualAddress::new(USER_STACK_TOP);
        let info = EntryInfo {
            entry: image.entry,
            program_headers: image.program_headers,
            random: self.random_bytes(),
        };
        let stack = initial_stack(top, argv, envp, &info)?;

        let mut frames = self.frames.lock_irq();
        let mut memory = UserMemory::new(&self.mapper, &mut *frames, self.kernel_root())?;
        if let Err(e) = self.fill_user(&mut memory, &mut frames, image, &stack.bytes, stack.sp) {
            memory.destroy(&self.mapper, &mut *frames);
            return Err(e);
        }
        Ok((memory, TrapFrame::user(image.entry, stack.sp)))
    }

    fn fill_user(
        &self,
        memory: &mut UserMemory,
        frames: &mut BitmapFrameAlloc,
        image: &Image<'_>,
        stack: &[u8],
        sp: VirtualAddress,
    ) -> Result<(), TaskError> {
        for segment in &image.segments {
            let end = segment.area_end().ok_or(ImageError::BadProgramHeader)?;
            memory.add_area(Vma::new(
                segment.area_start(),
                end,
                segment.flags,
                segment.kind(),
            )?)?;
            memory.load_bytes(&self.mapper, frames, segment.vaddr, segment.data)?;
        }
        memory.vmas_mut().set_heap_start(image.end());

        let top = VirtualAddress::new(USER_STACK_TOP);
        memory.map_anonymous(
            VirtualAddress::new(USER_STACK_TOP - USER_STACK_SIZE),
            USER_STACK_SIZE,
            VmaFlags::USER_RW,
        )?;
        let eager = VirtualAddress::new(USER_STACK_TOP - USER_STACK_EAGER_PAGES * PAGE_SIZE);
        memory.populate(&self.mapper, frames, eager, top)?;
        memory.load_bytes(&self.mapper, frames, sp, stack)?;
        Ok(())
    }

    /// Reserve the lowest free slot of the thread-stack region and populate
    /// its top page. Returns the base of the usable part, above the guard.
    fn carve_thread_stack(
        &self,
        cpu: CpuId,
        memory: &SharedMemory,
    ) -> Result<VirtualAddress, TaskError> {
        let mut mem = memory.lock_irq();
        let mut slot = THREAD_STACK_BASE;
        while slot + THREAD_STACK_SLOT <= THREAD_STACK_END {
            let base = VirtualAddress::new(slot + PAGE_SIZE);
            let end = VirtualAddress::new(slot + THREAD_STACK_SLOT);
            match mem.map_anonymous(base, THREAD_STACK_SLOT - PAGE_SIZE, VmaFlags::USER_RW) {
                Ok(_) => {
                    let top_page = VirtualAddress::new(end.as_u64() - PAGE_SIZE);
                    let populated =
                        mem.populate(&self.mapper, &mut *self.frames.lock_irq(), top_page, end);
                    if let Err(e) = populated {
                        drop(mem);
                        self.drop_thread_stack(cpu, memory, base);
                        return Err(e.into());
                    }
                    return Ok(base);
                }
                Err(VmmError::Vma(VmaError::Overlap { .. })) => {
                    let blocker = mem
                        .vmas()
                        .iter()
                        .filter(|v| v.overlaps(base, end))
                        .map(|v| v.end.as_u64())
                        .max()
                        .unwrap_or(end.as_u64());
                    let Some(next) =
                        checked_align_up(blocker - THREAD_STACK_BASE, THREAD_STACK_SLOT)
                    else {
                        break;
                    };
                    slot = THREAD_STACK_BASE + next;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TaskError::NoThreadStack)
    }

    fn drop_thread_stack(
        &self,
        cpu: CpuId,
        memory: &SharedMemory,
        base: VirtualAddress,
    ) {
        let unmapped = memory.lock_irq().munmap(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(cpu),
            base,
            THREAD_STACK_SLOT - PAGE_SIZE,
        );
        if let Err(e) = unmapped {
            warn!("thread stack at {base} not released: {e}");
        }
    }

    fn store_status(&self, cpu: CpuId, task: &Task, at: VirtualAddress, status: i32) {
        let Some(memory) = task.inner.lock_irq().memory.clone() else {
            return;
        };
        let written = memory.lock_irq().copy_to_user(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(cpu),
            at,
            &status.to_le_bytes(),
        );
        if let Err(e) = written {
            warn!("wait status for {} not stored at {at}: {e}", task.id());
        }
    }
}
