use crate::cpu::CpuId;
use crate::image::ImageError;
use crate::task::TaskId;
use kernel_alloc::{FrameAllocError, VmmError};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{MapError, VmaError};

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum TaskError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no free task slot")]
    NoFreeSlot,
    #[error("no task {0}")]
    NoSuchTask(TaskId),
    #[error("no core {0}")]
    NoSuchCpu(CpuId),
    #[error("unsupported core count {0}")]
    CpuCount(usize),
    #[error("nothing is running on core {0}")]
    NoCurrentTask(CpuId),
    #[error("task {0} has no user address space")]
    NotUserTask(TaskId),
    #[error("no child to wait for")]
    NoChildren,
    #[error("thread-stack region exhausted")]
    NoThreadStack,
    #[error("argument and environment strings too large")]
    ArgumentsTooLarge,
    #[error("privileged-mode page fault at {0}")]
    KernelFault(VirtualAddress),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Memory(#[from] VmmError),
    #[error(transparent)]
    Map(#[from] MapError),
}

impl From<FrameAllocError> for TaskError {
    fn from(_: FrameAllocError) -> Self {
        Self::OutOfMemory
    }
}

impl From<VmaError> for TaskError {
    fn from(e: VmaError) -> Self {
        Self::Memory(VmmError::Vma(e))
    }
}
