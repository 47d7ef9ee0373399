mod common;

use common::{BSP, DATA, Machine, TEXT};
use kernel_alloc::{FaultResolution, PageFaultError, VmmError};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_task::{
    FaultOutcome, Signal, SwitchOutcome, TaskError, TrapFrame, WaitOptions, WaitOutcome,
    WaitTarget, wait_status,
};
use kernel_vmem::{PageFlags, VmaError, VmaFlags};

fn user_write() -> PageFaultError {
    PageFaultError::new().with_user(true).with_write(true)
}

fn user_read() -> PageFaultError {
    PageFaultError::new().with_user(true)
}

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

#[test]
fn untouched_data_is_allocated_on_demand() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));
    let memory = m.kernel.memory_of(p).unwrap();
    assert!(m.kernel.query_entry(&memory, va(DATA)).is_none_or(|e| !e.is_present()));

    let free = m.kernel.free_frames();
    let outcome = m
        .kernel
        .handle_page_fault(BSP, &mut frame, va(DATA + 0x10), user_write())
        .unwrap();
    assert_eq!(outcome, FaultOutcome::Resolved(FaultResolution::DemandAllocated));
    let entry = m.kernel.query_entry(&memory, va(DATA)).unwrap();
    assert!(entry.is_present() && entry.is_writable() && entry.is_user());
    assert!(free - m.kernel.free_frames() >= 1);

    // The second page shares the tables of the first.
    let free = m.kernel.free_frames();
    m.kernel
        .handle_page_fault(BSP, &mut frame, va(DATA + PAGE_SIZE), user_read())
        .unwrap();
    assert_eq!(m.kernel.free_frames(), free - 1);
}

#[test]
fn writes_to_shared_pages_are_copied() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));
    m.write_u8(p, DATA, 0x11);
    let c = m.kernel.fork(BSP, &mut frame).unwrap();

    let parent_memory = m.kernel.memory_of(p).unwrap();
    let shared = m.kernel.query_entry(&parent_memory, va(DATA)).unwrap();
    assert!(!shared.is_writable());
    assert_eq!(m.kernel.frame_refs(shared.frame()), 2);

    let outcome = m
        .kernel
        .handle_page_fault(BSP, &mut frame, va(DATA), user_write())
        .unwrap();
    assert_eq!(outcome, FaultOutcome::Resolved(FaultResolution::CopiedOnWrite));
    let private = m.kernel.query_entry(&parent_memory, va(DATA)).unwrap();
    assert!(private.is_writable());
    assert_ne!(private.frame(), shared.frame());
    assert_eq!(m.kernel.frame_refs(shared.frame()), 1);

    // The child is now the only owner and writes in place.
    assert_eq!(m.switch(BSP, &mut frame), Some(c));
    let outcome = m
        .kernel
        .handle_page_fault(BSP, &mut frame, va(DATA), user_write())
        .unwrap();
    assert_eq!(outcome, FaultOutcome::Resolved(FaultResolution::MadeWritable));
    let child_memory = m.kernel.memory_of(c).unwrap();
    assert_eq!(
        m.kernel.query_entry(&child_memory, va(DATA)).unwrap().frame(),
        shared.frame()
    );
    assert_eq!(m.read_u8(c, DATA), 0x11);
}

#[test]
fn a_stray_access_kills_the_task() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));
    let c = m.kernel.fork(BSP, &mut frame).unwrap();
    assert_eq!(m.switch(BSP, &mut frame), Some(c));

    let outcome = m
        .kernel
        .handle_page_fault(BSP, &mut frame, va(0x1000), user_read())
        .unwrap();
    assert_eq!(outcome, FaultOutcome::Terminated(SwitchOutcome::Switched(p)));
    assert_eq!(m.kernel.current(BSP), Some(p));
    assert_eq!(m.kernel.task(c).unwrap().exit_code, Signal::SIGSEGV.exit_code());

    let reaped = m
        .kernel
        .wait(BSP, &mut frame, WaitTarget::Task(c), WaitOptions::NOHANG, None)
        .unwrap();
    assert_eq!(
        reaped,
        WaitOutcome::Reaped {
            child: c,
            status: wait_status(139)
        }
    );
}

#[test]
fn writing_to_text_is_fatal() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));

    let outcome = m
        .kernel
        .handle_page_fault(BSP, &mut frame, va(TEXT), user_write())
        .unwrap();
    assert_eq!(outcome, FaultOutcome::Terminated(SwitchOutcome::Idle));
    assert!(m.kernel.task(p).is_none());
    assert!(!frame.is_user());
}

#[test]
fn privileged_faults_are_not_handled() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));

    let mut kernel_frame = TrapFrame::default();
    let addr = va(0xffff_8000_dead_0000);
    assert_eq!(
        m.kernel
            .handle_page_fault(BSP, &mut kernel_frame, addr, PageFaultError::new().with_write(true)),
        Err(TaskError::KernelFault(addr))
    );
    // Nothing was rescheduled.
    assert_eq!(m.kernel.current(BSP), Some(p));
}

#[test]
fn anonymous_mappings_come_and_go() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));

    let at = m.kernel.mmap(BSP, 3 * PAGE_SIZE, VmaFlags::READ | VmaFlags::WRITE).unwrap();
    assert!(at.is_user());
    assert_eq!(m.vma_count(p), 4);
    m.kernel.copy_to_user(BSP, at, &[7; 3 * 4096]).unwrap();
    let mut back = [0u8; 16];
    m.kernel
        .copy_from_user(BSP, at + 2 * PAGE_SIZE, &mut back)
        .unwrap();
    assert_eq!(back, [7; 16]);

    let free = m.kernel.free_frames();
    m.kernel.munmap(BSP, at + PAGE_SIZE, PAGE_SIZE).unwrap();
    assert_eq!(m.kernel.free_frames(), free + 1);
    assert!(matches!(
        m.kernel.copy_from_user(BSP, at + PAGE_SIZE, &mut back),
        Err(TaskError::Memory(_))
    ));
    assert_eq!(m.vma_count(p), 5);
}

#[test]
fn mapping_lengths_are_checked() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));

    assert_eq!(
        m.kernel.mmap(BSP, 0, VmaFlags::USER_RW),
        Err(TaskError::Memory(VmmError::Vma(VmaError::NoSpace(0))))
    );
    for len in [u64::MAX - 0xFFF, u64::MAX, 1 << 63] {
        assert!(
            matches!(
                m.kernel.mmap(BSP, len, VmaFlags::USER_RW),
                Err(TaskError::Memory(VmmError::Vma(VmaError::NoSpace(_))))
            ),
            "{len:#x}"
        );
    }
    assert_eq!(m.vma_count(p), 3);

    // Lengths are rounded up to whole pages.
    let at = m.kernel.mmap(BSP, PAGE_SIZE + 1, VmaFlags::USER_RW).unwrap();
    m.kernel.copy_to_user(BSP, at + PAGE_SIZE, &[1; 16]).unwrap();
    assert!(m.kernel.copy_to_user(BSP, at + 2 * PAGE_SIZE, &[1]).is_err());

    assert!(m.kernel.munmap(BSP, at, 0).is_err());
    assert!(m.kernel.munmap(BSP, at + 1, PAGE_SIZE).is_err());
    assert!(m.kernel.munmap(BSP, at, u64::MAX).is_err());
    assert_eq!(m.vma_count(p), 4);
    m.kernel.munmap(BSP, at, PAGE_SIZE + 1).unwrap();
    assert_eq!(m.vma_count(p), 3);

    // An impossible break is ignored.
    let start = m.kernel.brk(BSP, va(0)).unwrap();
    assert_eq!(m.kernel.brk(BSP, va(u64::MAX)).unwrap(), start);
    assert_eq!(m.kernel.brk(BSP, va(u64::MAX - 0xFFF)).unwrap(), start);
}

#[test]
fn the_break_grows_and_shrinks() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));

    let start = m.kernel.brk(BSP, va(0)).unwrap();
    assert_eq!(start, va(DATA + 2 * PAGE_SIZE));

    let end = start + 2 * PAGE_SIZE + 0x10;
    assert_eq!(m.kernel.brk(BSP, end).unwrap(), end);
    m.kernel.copy_to_user(BSP, start, &[1; 16]).unwrap();
    let free = m.kernel.free_frames();
    m.kernel.copy_to_user(BSP, start + PAGE_SIZE, &[2; 16]).unwrap();
    assert_eq!(m.kernel.free_frames(), free - 1);

    // Shrinking gives the pages back.
    assert_eq!(m.kernel.brk(BSP, start).unwrap(), start);
    assert_eq!(m.kernel.free_frames(), free + 1);
    assert!(m.kernel.copy_to_user(BSP, start, &[3]).is_err());
}

#[test]
fn raw_mappings_hold_one_reference() {
    let m = Machine::new(1);
    let space = m.kernel.create_address_space().unwrap();
    let frame = m.kernel.allocate_frame().unwrap();
    let page = VirtualPage::containing(va(0x1234_5000));

    m.kernel.map(&space, page, frame, PageFlags::USER_DATA).unwrap();
    let entry = m.kernel.query_entry(&space, va(0x1234_5678)).unwrap();
    assert!(entry.is_present() && entry.is_user());
    assert_eq!(entry.frame(), frame);
    assert_eq!(m.kernel.frame_refs(frame), 1);
    assert!(m.kernel.map(&space, page, frame, PageFlags::USER_DATA).is_err());

    assert_eq!(m.kernel.unmap(BSP, &space, page), Some(frame));
    assert_eq!(m.kernel.frame_refs(frame), 0);
    assert_eq!(m.kernel.unmap(BSP, &space, page), None);

    // A mapping still in place goes with the space.
    let other = m.kernel.allocate_frame().unwrap();
    m.kernel.map(&space, page, other, PageFlags::USER_DATA).unwrap();
    m.kernel.destroy_address_space(space);
    assert_eq!(m.kernel.frame_refs(other), 0);
    assert_eq!(m.kernel.free_frames(), m.baseline);
}

#[test]
fn map_user_targets_the_running_process() {
    let m = Machine::new(1);
    let p = m.spawn("p");
    let mut frame = TrapFrame::default();
    assert_eq!(m.switch(BSP, &mut frame), Some(p));

    let page = VirtualPage::containing(va(0x2000_0000));
    let backing = m.kernel.allocate_frame().unwrap();
    m.kernel
        .map_user(BSP, page, backing, PageFlags::USER_DATA)
        .unwrap();
    let memory = m.kernel.memory_of(p).unwrap();
    assert_eq!(
        m.kernel.query_entry(&memory, va(0x2000_0000)).map(|e| e.frame()),
        Some(backing)
    );
}

#[test]
fn map_user_without_a_process_stays_out_of_the_user_half() {
    let m = Machine::new(1);
    let frame = m.kernel.allocate_frame().unwrap();
    let page = VirtualPage::containing(va(0x2000_0000));
    assert_eq!(
        m.kernel.map_user(BSP, page, frame, PageFlags::USER_DATA),
        Err(TaskError::NoCurrentTask(BSP))
    );
    assert_eq!(m.kernel.frame_refs(frame), 1);
    assert!(m.kernel.release_frame(frame));
    assert_eq!(m.kernel.free_frames(), m.baseline);
}
