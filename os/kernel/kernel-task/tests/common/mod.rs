#![allow(dead_code)]

use kernel_alloc::DirectMapMapper;
use kernel_alloc::hosted::{HostRam, SoftMmu};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_task::image::Segment;
use kernel_task::{CoreHardware, CpuId, Image, ImageError, ImageLoader, Kernel, TaskId, TrapFrame};
use kernel_vmem::VmaFlags;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const BSP: CpuId = CpuId::BSP;
pub const TEXT: u64 = 0x40_0000;
pub const DATA: u64 = 0x60_0000;
pub const CODE: &[u8] = &[0x90, 0x90, 0x0f, 0x05, 0xeb, 0xfc];

/// A core model that only records what it is asked to load.
pub struct SoftCore {
    mmus: Vec<SoftMmu>,
    stacks: Vec<AtomicU64>,
    thread_pointers: Vec<AtomicU64>,
    tls_writes: Mutex<Vec<(CpuId, u64)>>,
}

impl SoftCore {
    pub fn new(cpus: usize) -> Self {
        Self {
            mmus: (0..cpus).map(|_| SoftMmu::default()).collect(),
            stacks: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            thread_pointers: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            tls_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn stack(&self, cpu: CpuId) -> u64 {
        self.stacks[cpu.as_index()].load(Ordering::Relaxed)
    }

    pub fn thread_pointer(&self, cpu: CpuId) -> u64 {
        self.thread_pointers[cpu.as_index()].load(Ordering::Relaxed)
    }

    pub fn tls_writes(&self) -> usize {
        self.tls_writes.lock().unwrap().len()
    }
}

impl CoreHardware for SoftCore {
    type Mmu = SoftMmu;

    fn mmu(&self, cpu: CpuId) -> &SoftMmu {
        &self.mmus[cpu.as_index()]
    }

    fn set_kernel_stack(&self, cpu: CpuId, top: VirtualAddress) {
        self.stacks[cpu.as_index()].store(top.as_u64(), Ordering::Relaxed);
    }

    fn set_thread_pointer(&self, cpu: CpuId, base: u64) {
        self.thread_pointers[cpu.as_index()].store(base, Ordering::Relaxed);
        self.tls_writes.lock().unwrap().push((cpu, base));
    }

    fn entropy(&self) -> u64 {
        0x5eed_f00d
    }
}

/// Text at [`TEXT`] holding the file bytes, plus `data_pages` of zeroed data
/// at [`DATA`]. Empty files are refused.
#[derive(Copy, Clone)]
pub struct Program {
    pub data_pages: u64,
}

impl Default for Program {
    fn default() -> Self {
        Self { data_pages: 2 }
    }
}

impl ImageLoader for Program {
    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<Image<'a>, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::TooShort);
        }
        Ok(Image {
            entry: VirtualAddress::new(TEXT),
            program_headers: None,
            segments: vec![
                Segment {
                    vaddr: VirtualAddress::new(TEXT),
                    mem_size: bytes.len() as u64,
                    data: bytes,
                    file_offset: 0,
                    flags: VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER,
                },
                Segment {
                    vaddr: VirtualAddress::new(DATA),
                    mem_size: self.data_pages * PAGE_SIZE,
                    data: &[],
                    file_offset: 0,
                    flags: VmaFlags::USER_RW,
                },
            ],
        })
    }
}

/// Parses fine, but both segments claim the same page.
pub struct Clashing;

impl ImageLoader for Clashing {
    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<Image<'a>, ImageError> {
        let segment = Segment {
            vaddr: VirtualAddress::new(TEXT),
            mem_size: bytes.len() as u64,
            data: bytes,
            file_offset: 0,
            flags: VmaFlags::READ | VmaFlags::USER,
        };
        Ok(Image {
            entry: VirtualAddress::new(TEXT),
            program_headers: None,
            segments: vec![segment, segment],
        })
    }
}

pub struct Machine {
    pub kernel: Kernel<DirectMapMapper, SoftCore>,
    /// Free frames right after boot.
    pub baseline: u64,
    // Declared last: the kernel's frames live in here.
    _ram: HostRam,
}

impl Machine {
    pub fn new(cpus: usize) -> Self {
        Self::with_frames(cpus, 2048)
    }

    pub fn with_frames(cpus: usize, frames: u64) -> Self {
        let ram = HostRam::new(frames);
        let kernel = Kernel::new(ram.mapper(), SoftCore::new(cpus), &ram.boot_info(), cpus)
            .expect("kernel boots");
        Self {
            baseline: kernel.free_frames(),
            kernel,
            _ram: ram,
        }
    }

    /// A user process running [`CODE`].
    pub fn spawn(&self, name: &str) -> TaskId {
        self.kernel
            .create_user(&Program::default(), CODE, &[name], &[])
            .expect("process created")
    }

    /// Switch `cpu` once and return what it runs now.
    pub fn switch(&self, cpu: CpuId, frame: &mut TrapFrame) -> Option<TaskId> {
        self.kernel.switch(cpu, frame).expect("switch").task()
    }

    pub fn read_u8(&self, id: TaskId, va: u64) -> u8 {
        let mut b = [0u8];
        self.kernel
            .read_memory(id, VirtualAddress::new(va), &mut b)
            .expect("readable");
        b[0]
    }

    pub fn read_u64(&self, id: TaskId, va: u64) -> u64 {
        let mut b = [0u8; 8];
        self.kernel
            .read_memory(id, VirtualAddress::new(va), &mut b)
            .expect("readable");
        u64::from_le_bytes(b)
    }

    pub fn write_u8(&self, id: TaskId, va: u64, value: u8) {
        self.kernel
            .write_memory(id, VirtualAddress::new(va), &[value])
            .expect("writable");
    }

    pub fn vma_count(&self, id: TaskId) -> usize {
        self.kernel.memory_of(id).expect("user task").lock_irq().vmas().len()
    }
}
