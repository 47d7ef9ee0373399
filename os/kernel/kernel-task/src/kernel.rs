//! # The kernel object
//!
//! [`Kernel`] owns every piece of global state of the scheduler and memory
//! core: the frame allocator, the kernel root, the task table and the
//! per-core descriptors. The scheduler ([`sched`](crate::sched)), the
//! lifecycle manager ([`lifecycle`](crate::lifecycle)) and the memory entry
//! points ([`memory`](crate::memory)) are `impl` blocks on it.
//!
//! ## Locks
//!
//! | Lock                    | Kind           | Protects                      |
//! |-------------------------|----------------|-------------------------------|
//! | `tasks`                 | spin, IRQ-safe | slot table, parent links      |
//! | `Cpu::queue`            | ticket, IRQ-safe | ready queue, current task   |
//! | `Task::inner`           | spin, IRQ-safe | one task's mutable state      |
//! | [`SharedMemory`]        | spin, IRQ-safe | one address space and its VMAs |
//! | `frames`                | spin, IRQ-safe | frame bitmap and refcounts    |
//!
//! Order: `tasks` → `queue` → `inner`, and `tasks` → memory → `frames`.
//! Nothing is taken while `inner` is held.
//!
//! Every lock is taken with `lock_irq`: the timer path takes all of them on
//! the core it interrupts.

use crate::arch::CoreHardware;
use crate::cpu::{Cpu, CpuId};
use crate::error::TaskError;
use crate::table::TaskTable;
use crate::task::{SharedMemory, Task, TaskId, TaskSnapshot};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_alloc::BitmapFrameAlloc;
use kernel_info::boot::BootInfo;
use kernel_info::memory::MAX_CPUS;
use kernel_memory_addresses::PhysicalPage;
use kernel_sync::SpinMutex;
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, RootPage};
use log::info;

pub struct Kernel<M: PhysMapper, H: CoreHardware> {
    pub(crate) mapper: M,
    pub(crate) hw: H,
    kernel_root: RootPage,
    pub(crate) frames: SpinMutex<BitmapFrameAlloc>,
    pub(crate) tasks: SpinMutex<TaskTable>,
    cpus: Vec<Cpu>,
    next_cpu: AtomicUsize,
    seed: AtomicU64,
}

impl<M: PhysMapper, H: CoreHardware> Kernel<M, H> {
    /// Take over physical memory, build the kernel root and set up `cpus`
    /// idle cores.
    ///
    /// # Errors
    /// [`TaskError::CpuCount`] outside `1..=MAX_CPUS`,
    /// [`TaskError::Map`] if the kernel root doesn't fit in memory.
    pub fn new(mapper: M, hw: H, boot: &BootInfo<'_>, cpus: usize) -> Result<Self, TaskError> {
        if !(1..=MAX_CPUS).contains(&cpus) {
            return Err(TaskError::CpuCount(cpus));
        }
        let mut frames = BitmapFrameAlloc::new(boot);
        let kernel_root = AddressSpace::new_kernel(&mapper, &mut frames, boot)?.root_page();
        let cores = (0..cpus)
            .map(|i| Cpu::new(CpuId::new(u32::try_from(i).unwrap_or(u32::MAX))))
            .collect();
        let seed = hw.entropy();
        info!(
            "kernel core up: {cpus} cores, kernel root {kernel_root:?}, {} free frames",
            frames.free_frames()
        );
        Ok(Self {
            mapper,
            hw,
            kernel_root,
            frames: SpinMutex::new(frames),
            tasks: SpinMutex::new(TaskTable::new()),
            cpus: cores,
            next_cpu: AtomicUsize::new(0),
            seed: AtomicU64::new(seed),
        })
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    /// The root every privileged-only task and every idle core runs on.
    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// # Errors
    /// [`TaskError::NoSuchCpu`].
    pub fn cpu(&self, cpu: CpuId) -> Result<&Cpu, TaskError> {
        self.cpus.get(cpu.as_index()).ok_or(TaskError::NoSuchCpu(cpu))
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.frames.lock_irq().free_frames()
    }

    /// References held on `page`; 0 if it is free.
    #[must_use]
    pub fn frame_refs(&self, page: PhysicalPage) -> u32 {
        self.frames.lock_irq().ref_count(page)
    }

    /// A frame for [`map`](Self::map); its single reference goes to the
    /// mapping.
    ///
    /// # Errors
    /// [`TaskError::OutOfMemory`].
    pub fn allocate_frame(&self) -> Result<PhysicalPage, TaskError> {
        let frame = self.frames.lock_irq().alloc_4k().ok_or(TaskError::OutOfMemory)?;
        self.mapper.zero_frame(frame);
        Ok(frame)
    }

    /// Drop one reference on `page`; returns whether it became free.
    pub fn release_frame(&self, page: PhysicalPage) -> bool {
        self.frames.lock_irq().release(page)
    }

    /// The task in slot `id`, zombies included.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        let task = self.tasks.lock_irq().get(id).cloned()?;
        Some(task.snapshot())
    }

    /// Ids of every occupied slot.
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.lock_irq().iter().map(|t| t.id()).collect()
    }

    /// The task running on `cpu`.
    #[must_use]
    pub fn current(&self, cpu: CpuId) -> Option<TaskId> {
        self.cpus.get(cpu.as_index()).and_then(Cpu::current)
    }

    /// Address space of task `id`, if it has one.
    #[must_use]
    pub fn memory_of(&self, id: TaskId) -> Option<SharedMemory> {
        let task = self.tasks.lock_irq().get(id).cloned()?;
        task.inner.lock_irq().memory.clone()
    }

    pub(crate) fn lookup(&self, id: TaskId) -> Result<Arc<Task>, TaskError> {
        self.tasks
            .lock_irq()
            .get(id)
            .cloned()
            .ok_or(TaskError::NoSuchTask(id))
    }

    pub(crate) fn current_task(&self, cpu: CpuId) -> Result<Arc<Task>, TaskError> {
        self.cpu(cpu)?
            .queue
            .lock_irq()
            .current
            .clone()
            .ok_or(TaskError::NoCurrentTask(cpu))
    }

    /// Round-robin placement of a new task.
    pub(crate) fn place(&self) -> CpuId {
        let n = self.next_cpu.fetch_add(1, Ordering::Relaxed) % self.cpus.len();
        self.cpus[n].id()
    }

    /// Append `task` to its core's ready queue.
    pub(crate) fn enqueue(&self, task: &Arc<Task>) -> Result<(), TaskError> {
        self.cpu(task.cpu())?
            .queue
            .lock_irq()
            .ready
            .push_back(Arc::clone(task));
        Ok(())
    }

    /// 16 bytes for `AT_RANDOM` (splitmix64 over the boot seed).
    pub(crate) fn random_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for chunk in out.chunks_exact_mut(8) {
            let mut z = self
                .seed
                .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
                .wrapping_add(0x9e37_79b9_7f4a_7c15);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            chunk.copy_from_slice(&(z ^ (z >> 31)).to_le_bytes());
        }
        out
    }
}
