//! The FAT12 program loader and the `execute` syscall's two-phase handoff (§4.6).
//!
//! The syscall body validates the filename and stashes it in `PENDING`, then returns immediately
//! — it cannot itself clone an address space and load a program, because doing so takes page
//! faults while building the new mappings, and the syscall runs with interrupts disabled. A
//! dedicated kernel task (`worker_task_entry`, spawned once from `kernel_main`) polls the slot
//! with interrupts enabled and performs the actual load.

use alloc::boxed::Box;
use alloc::vec;

use spin::Mutex;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::fs::fat12;
use crate::memory::{pfa, vmm};
use crate::sched::task::Pid;

struct PendingCommand {
    name83: [u8; 11],
}

static PENDING: Mutex<Option<PendingCommand>> = Mutex::new(None);

const KERNEL_STACK_PAGES: u64 = 4; // 16 KiB

/// Validate and stash an `execute` request. Returns `false` if a request is already outstanding
/// (one at a time — the worker drains it before the next `int 0x80` can post another).
pub fn request_execute(name83: [u8; 11]) -> bool {
    let mut slot = PENDING.lock();
    if slot.is_some() {
        return false;
    }
    *slot = Some(PendingCommand { name83 });
    true
}

fn take_pending() -> Option<PendingCommand> {
    PENDING.lock().take()
}

/// The worker kernel task's entire body (§4.6 "a dedicated kernel task polls this slot"). Runs
/// forever, rotating with every other task the same as any other kernel task.
pub fn worker_task_entry() -> ! {
    loop {
        if let Some(cmd) = take_pending() {
            load_and_spawn(&cmd.name83);
        }
        x86_64::instructions::hlt();
    }
}

fn switch_cr3(new_phys: u64) -> u64 {
    let (old_frame, _) = Cr3::read();
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(new_phys)),
            Cr3Flags::empty(),
        );
    }
    old_frame.start_address().as_u64()
}

/// Touch a word at `addr` with a read-modify-write, the same pre-fault idiom
/// `original_source/main64/kernel/multitasking/multitasking.c` uses
/// (`kernelModeStackPtr[0] = kernelModeStackPtr[0]`) to force a backing frame resident before a
/// task is ever scheduled (§4.5 "Stack pre-fault"). Here the pages are already explicitly mapped
/// below, so this is a defensive no-op rather than the trigger for demand paging -- kept for
/// fidelity with the spec's stated mechanism.
unsafe fn touch(addr: u64) {
    let p = addr as *mut u64;
    core::ptr::write_volatile(p, core::ptr::read_volatile(p));
}

/// A kernel stack is just heap memory that is never freed -- consistent with the baseline's
/// documented leak-on-terminate policy (§5, §9 Open Question #3): nothing reclaims it even once
/// its owning task is gone.
pub(crate) fn alloc_kernel_stack() -> u64 {
    let size = (KERNEL_STACK_PAGES * pfa::FRAME_SIZE) as usize;
    let mem = vec![0u8; size].into_boxed_slice();
    let top = Box::leak(mem).as_ptr() as u64 + size as u64;
    unsafe {
        touch(top - 8);
    }
    top
}

/// Clone the kernel address space, load `name83`'s FAT12 program at `EXECUTABLE_BASE_ADDRESS`,
/// give it a stack, and register it with the scheduler (§4.5 "Task creation (user-mode)").
fn load_and_spawn(name83: &[u8; 11]) -> Option<Pid> {
    let mut name8 = [b' '; 8];
    let mut ext3 = [b' '; 3];
    name8.copy_from_slice(&name83[0..8]);
    ext3.copy_from_slice(&name83[8..11]);

    let (entry_idx, file_size) = fat12::find(&name8, &ext3)?;

    let new_cr3 = vmm::clone_address_space();
    let old_cr3 = switch_cr3(new_cr3);

    // Map the program's pages explicitly (not via demand paging -- we are running at ring 0
    // right now, so a fault here would not pick up USER_ACCESSIBLE), then copy its bytes in
    // directly, mirroring how `memory::init` explicitly maps the kernel heap instead of relying
    // on the page-fault handler during its own bootstrap.
    let program_pages = file_size as u64 / pfa::FRAME_SIZE + 1;
    let mut addr = vmm::EXECUTABLE_BASE_ADDRESS;
    for _ in 0..program_pages {
        let pfn = pfa::allocate();
        assert_ne!(pfn, pfa::OUT_OF_MEMORY, "loader: OOM mapping program");
        vmm::map(addr, pfn * pfa::FRAME_SIZE, true);
        addr += pfa::FRAME_SIZE;
    }
    if file_size > 0 {
        let dst = unsafe {
            core::slice::from_raw_parts_mut(vmm::EXECUTABLE_BASE_ADDRESS as *mut u8, file_size as usize)
        };
        fat12::read(entry_idx, 0, dst);
    }

    let mut stack_addr = vmm::USER_STACK_TOP - vmm::USER_STACK_PAGES * pfa::FRAME_SIZE;
    for _ in 0..vmm::USER_STACK_PAGES {
        let pfn = pfa::allocate();
        assert_ne!(pfn, pfa::OUT_OF_MEMORY, "loader: OOM mapping user stack");
        vmm::map(stack_addr, pfn * pfa::FRAME_SIZE, true);
        stack_addr += pfa::FRAME_SIZE;
    }
    unsafe {
        touch(vmm::USER_STACK_TOP - 8);
    }

    switch_cr3(old_cr3);

    let kernel_stack_top = alloc_kernel_stack();
    let pid = crate::sched::spawn_user(
        vmm::EXECUTABLE_BASE_ADDRESS,
        vmm::USER_STACK_TOP,
        kernel_stack_top,
        new_cr3,
    );
    printk!("loader: spawned pid {} from FAT12 program\n", pid);
    Some(pid)
}
