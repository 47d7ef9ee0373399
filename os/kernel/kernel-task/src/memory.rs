//! # Address-space entry points
//!
//! The page-fault entry, raw mapping at explicit addresses and the
//! per-process memory calls (`mmap`, `munmap`, `brk`, user copies) on behalf
//! of the task running on a core.
//!
//! Locks: the address space first, then `frames`.

use crate::arch::CoreHardware;
use crate::cpu::{CpuId, SwitchOutcome};
use crate::error::TaskError;
use crate::frame::TrapFrame;
use crate::kernel::Kernel;
use crate::sched::Transition;
use crate::task::{SharedMemory, Signal, TaskId};
use alloc::sync::Arc;
use kernel_alloc::{FaultAccess, FaultResolution, PageFaultError, UserMemory, VmmError};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};
use kernel_sync::SpinMutex;
use kernel_vmem::{AddressSpace, FrameAlloc, PageFlags, PageTableEntry, PhysMapper, VmaFlags};
use log::{debug, error, warn};

/// What became of a page fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The access can be retried.
    Resolved(FaultResolution),
    /// The faulting task was terminated with `SIGSEGV`; the frame now holds
    /// the next context.
    Terminated(SwitchOutcome),
}

impl<M: PhysMapper, H: CoreHardware> Kernel<M, H> {
    /// Page-fault entry: `addr` from CR2, `code` from the exception frame.
    ///
    /// # Errors
    /// [`TaskError::KernelFault`] for faults in privileged mode; the trap
    /// layer halts the core.
    pub fn handle_page_fault(
        &self,
        cpu: CpuId,
        frame: &mut TrapFrame,
        addr: VirtualAddress,
        code: PageFaultError,
    ) -> Result<FaultOutcome, TaskError> {
        if !frame.is_user() {
            error!(
                "core {cpu}: privileged page fault at {addr}, rip {:#x}: {}",
                frame.instruction_pointer(),
                code.explain()
            );
            return Err(TaskError::KernelFault(addr));
        }

        let task = self.current_task(cpu)?;
        let memory = task.inner.lock_irq().memory.clone();
        let resolved = match memory {
            Some(memory) => memory
                .lock_irq()
                .resolve_fault(
                    &self.mapper,
                    &mut *self.frames.lock_irq(),
                    self.hw.mmu(cpu),
                    addr,
                    FaultAccess::from(code),
                )
                .map_err(VmmError::from),
            None => Err(VmmError::BadAddress(addr)),
        };

        match resolved {
            Ok(resolution) => {
                debug!("task {}: fault at {addr} {resolution:?}", task.id());
                Ok(FaultOutcome::Resolved(resolution))
            }
            Err(e) => {
                warn!(
                    "task {} killed: {e} (rip {:#x}, {})",
                    task.id(),
                    frame.instruction_pointer(),
                    code.explain()
                );
                self.terminate(&task, Signal::SIGSEGV.exit_code())?;
                let outcome = self.reschedule(cpu, frame, Transition::Yield)?;
                Ok(FaultOutcome::Terminated(outcome))
            }
        }
    }

    /// An empty user address space sharing the kernel half.
    ///
    /// # Errors
    /// [`TaskError::Memory`] if the root can't be allocated.
    pub fn create_address_space(&self) -> Result<SharedMemory, TaskError> {
        let memory = UserMemory::new(&self.mapper, &mut *self.frames.lock_irq(), self.kernel_root())?;
        Ok(Arc::new(SpinMutex::new(memory)))
    }

    /// Drop a handle; the last one frees every frame and table.
    pub fn destroy_address_space(&self, memory: SharedMemory) {
        self.release_memory(memory);
    }

    /// Install `frame` at `page` in `memory`. The frame's reference moves to
    /// the mapping. No area is recorded.
    ///
    /// # Errors
    /// [`TaskError::Map`].
    pub fn map(
        &self,
        memory: &SharedMemory,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageFlags,
    ) -> Result<(), TaskError> {
        let memory = memory.lock_irq();
        memory
            .space(&self.mapper)
            .map(&mut *self.frames.lock_irq(), page, frame, flags)?;
        Ok(())
    }

    /// [`map`](Self::map) into the space active on `cpu`: the running
    /// task's, or the kernel root for kernel-half pages.
    ///
    /// # Errors
    /// [`TaskError::Map`], [`TaskError::NoCurrentTask`] for a user-half page
    /// with no user task running.
    pub fn map_user(
        &self,
        cpu: CpuId,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageFlags,
    ) -> Result<(), TaskError> {
        let memory = self
            .current_task(cpu)
            .ok()
            .and_then(|t| t.inner.lock_irq().memory.clone());
        if let Some(memory) = memory {
            return self.map(&memory, page, frame, flags);
        }
        if page.base().is_user() {
            return Err(TaskError::NoCurrentTask(cpu));
        }
        AddressSpace::from_root(&self.mapper, self.kernel_root()).map(
            &mut *self.frames.lock_irq(),
            page,
            frame,
            flags,
        )?;
        Ok(())
    }

    /// Clear the leaf at `page` and drop the mapping's reference on its
    /// frame. Returns the frame that was mapped.
    pub fn unmap(
        &self,
        cpu: CpuId,
        memory: &SharedMemory,
        page: VirtualPage,
    ) -> Option<PhysicalPage> {
        let memory = memory.lock_irq();
        let frame = memory.space(&self.mapper).unmap(page, self.hw.mmu(cpu))?;
        self.frames.lock_irq().release(frame);
        Some(frame)
    }

    /// The raw leaf for `va`, present or not.
    #[must_use]
    pub fn query_entry(&self, memory: &SharedMemory, va: VirtualAddress) -> Option<PageTableEntry> {
        memory.lock_irq().space(&self.mapper).entry(va)
    }

    /// Reserve `len` bytes of anonymous user memory for the running task.
    ///
    /// # Errors
    /// [`TaskError::NotUserTask`], [`TaskError::Memory`] if nothing fits.
    pub fn mmap(&self, cpu: CpuId, len: u64, flags: VmaFlags) -> Result<VirtualAddress, TaskError> {
        let memory = self.current_memory(cpu)?;
        let start = memory.lock_irq().mmap(len, flags | VmaFlags::USER)?;
        Ok(start)
    }

    /// # Errors
    /// [`TaskError::NotUserTask`], [`TaskError::Memory`] for bad ranges.
    pub fn munmap(&self, cpu: CpuId, addr: VirtualAddress, len: u64) -> Result<(), TaskError> {
        let memory = self.current_memory(cpu)?;
        memory.lock_irq().munmap(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(cpu),
            addr,
            len,
        )?;
        Ok(())
    }

    /// Move the running task's program break; returns the break in effect.
    ///
    /// # Errors
    /// [`TaskError::NotUserTask`].
    pub fn brk(&self, cpu: CpuId, requested: VirtualAddress) -> Result<VirtualAddress, TaskError> {
        let memory = self.current_memory(cpu)?;
        let brk = memory.lock_irq().brk(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(cpu),
            requested,
        );
        Ok(brk)
    }

    /// # Errors
    /// [`TaskError::NotUserTask`], [`TaskError::Memory`] for ranges the
    /// task may not write.
    pub fn copy_to_user(&self, cpu: CpuId, dst: VirtualAddress, src: &[u8]) -> Result<(), TaskError> {
        let memory = self.current_memory(cpu)?;
        memory.lock_irq().copy_to_user(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(cpu),
            dst,
            src,
        )?;
        Ok(())
    }

    /// # Errors
    /// [`TaskError::NotUserTask`], [`TaskError::Memory`] for ranges the
    /// task may not read.
    pub fn copy_from_user(
        &self,
        cpu: CpuId,
        src: VirtualAddress,
        dst: &mut [u8],
    ) -> Result<(), TaskError> {
        let memory = self.current_memory(cpu)?;
        memory.lock_irq().copy_from_user(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(cpu),
            src,
            dst,
        )?;
        Ok(())
    }

    /// Set the running task's thread pointer and load it.
    ///
    /// # Errors
    /// [`TaskError::Memory`] for addresses outside the user half.
    pub fn set_thread_pointer(&self, cpu: CpuId, base: VirtualAddress) -> Result<(), TaskError> {
        if !base.is_user() {
            return Err(VmmError::BadAddress(base).into());
        }
        let task = self.current_task(cpu)?;
        task.inner.lock_irq().tls_base = base.as_u64();
        self.hw.set_thread_pointer(cpu, base.as_u64());
        self.cpu(cpu)?.set_tls_base(base.as_u64());
        Ok(())
    }

    /// Read user memory of task `id`, faulting pages in as a read would.
    ///
    /// # Errors
    /// [`TaskError::NoSuchTask`], [`TaskError::NotUserTask`],
    /// [`TaskError::Memory`].
    pub fn read_memory(&self, id: TaskId, va: VirtualAddress, buf: &mut [u8]) -> Result<(), TaskError> {
        let task = self.lookup(id)?;
        let memory = self.memory_of(id).ok_or(TaskError::NotUserTask(id))?;
        memory.lock_irq().copy_from_user(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(task.cpu()),
            va,
            buf,
        )?;
        Ok(())
    }

    /// Write user memory of task `id`, breaking copy-on-write sharing as a
    /// write would.
    ///
    /// # Errors
    /// As [`read_memory`](Self::read_memory).
    pub fn write_memory(&self, id: TaskId, va: VirtualAddress, data: &[u8]) -> Result<(), TaskError> {
        let task = self.lookup(id)?;
        let memory = self.memory_of(id).ok_or(TaskError::NotUserTask(id))?;
        memory.lock_irq().copy_to_user(
            &self.mapper,
            &mut *self.frames.lock_irq(),
            self.hw.mmu(task.cpu()),
            va,
            data,
        )?;
        Ok(())
    }

    fn current_memory(&self, cpu: CpuId) -> Result<SharedMemory, TaskError> {
        let task = self.current_task(cpu)?;
        let memory = task.inner.lock_irq().memory.clone();
        memory.ok_or(TaskError::NotUserTask(task.id()))
    }
}
