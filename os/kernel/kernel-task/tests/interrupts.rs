//! The host backend keeps one process-wide interrupt flag, so every check
//! lives in a single test to keep them from racing.

mod common;

use common::{BSP, CODE, DATA, Program};
use kernel_alloc::PageFaultError;
use kernel_alloc::hosted::{HostRam, SoftMmu};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};
use kernel_sync::irq::interrupts_enabled;
use kernel_task::{CoreHardware, CpuId, FaultOutcome, Kernel, Signal, TrapFrame};
use kernel_vmem::{Mmu, PageFlags, VmaFlags};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts TLB maintenance, and how much of it ran with interrupts enabled.
/// Every such call happens under an address-space lock.
#[derive(Default)]
struct WatchedMmu {
    soft: SoftMmu,
    calls: AtomicUsize,
    unmasked: AtomicUsize,
}

impl WatchedMmu {
    fn note(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if interrupts_enabled() {
            self.unmasked.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Mmu for WatchedMmu {
    fn invalidate_page(&self, page: VirtualPage) {
        self.note();
        self.soft.invalidate_page(page);
    }

    fn flush_all(&self) {
        self.note();
        self.soft.flush_all();
    }

    fn activate(&self, root: PhysicalPage) {
        self.soft.activate(root);
    }

    fn active_root(&self) -> PhysicalPage {
        self.soft.active_root()
    }
}

#[derive(Default)]
struct WatchedCore {
    mmu: WatchedMmu,
}

impl CoreHardware for WatchedCore {
    type Mmu = WatchedMmu;

    fn mmu(&self, _cpu: CpuId) -> &WatchedMmu {
        &self.mmu
    }

    fn set_kernel_stack(&self, _cpu: CpuId, _top: VirtualAddress) {}

    fn set_thread_pointer(&self, _cpu: CpuId, _base: u64) {}

    fn entropy(&self) -> u64 {
        1
    }
}

#[test]
fn address_space_work_runs_with_interrupts_masked() {
    assert!(interrupts_enabled());
    let ram = HostRam::new(2048);
    let kernel = Kernel::new(ram.mapper(), WatchedCore::default(), &ram.boot_info(), 1)
        .expect("kernel boots");
    let p = kernel
        .create_user(&Program::default(), CODE, &["p"], &[])
        .unwrap();
    let mut frame = TrapFrame::default();
    kernel.switch(BSP, &mut frame).unwrap();

    // Fork write-protects the parent, the next write copies.
    kernel.copy_to_user(BSP, VirtualAddress::new(DATA), &[1; 16]).unwrap();
    let c = kernel.fork(BSP, &mut frame).unwrap();
    let write = PageFaultError::new().with_user(true).with_write(true);
    assert!(matches!(
        kernel.handle_page_fault(BSP, &mut frame, VirtualAddress::new(DATA), write),
        Ok(FaultOutcome::Resolved(_))
    ));

    let at = kernel.mmap(BSP, 2 * PAGE_SIZE, VmaFlags::USER_RW).unwrap();
    kernel.copy_to_user(BSP, at, &[2; 2 * 4096]).unwrap();
    kernel.munmap(BSP, at, 2 * PAGE_SIZE).unwrap();

    let start = kernel.brk(BSP, VirtualAddress::new(0)).unwrap();
    kernel.brk(BSP, start + PAGE_SIZE).unwrap();
    kernel.copy_to_user(BSP, start, &[3]).unwrap();
    assert_eq!(kernel.brk(BSP, start).unwrap(), start);

    let space = kernel.create_address_space().unwrap();
    let page = VirtualPage::containing(VirtualAddress::new(0x1234_5000));
    let backing = kernel.allocate_frame().unwrap();
    kernel.map(&space, page, backing, PageFlags::USER_DATA).unwrap();
    assert_eq!(kernel.unmap(BSP, &space, page), Some(backing));
    kernel.destroy_address_space(space);

    let mmu = &kernel.hardware().mmu;
    assert!(mmu.calls.load(Ordering::Relaxed) >= 5);
    assert_eq!(mmu.unmasked.load(Ordering::Relaxed), 0);
    assert!(interrupts_enabled());

    // While the foreground holds an address space, no tick can land.
    let memory = kernel.memory_of(p).unwrap();
    {
        let _held = memory.lock_irq();
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    // A pending signal and a kill leave the state as they found it, and the
    // next tick cleans up.
    kernel.raise_signal(c, Signal::SIGCHLD).unwrap();
    assert!(kernel.kill(c, Signal::SIGKILL).unwrap());
    assert!(interrupts_enabled());
    kernel.switch(BSP, &mut frame).unwrap();
    assert!(interrupts_enabled());
    assert!(kernel.task(c).is_some_and(|t| t.exit_code == Signal::SIGKILL.exit_code()));
}
