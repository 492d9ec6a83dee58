//! General Protection Fault — the one exception that is *not* always machine-fatal (§7, §8 E5:
//! "A user task executing `outb` raises GP fault; the task is terminated; other tasks continue
//! running").
//!
//! A plain `extern "x86-interrupt"` handler only exposes the CPU-pushed frame, not the GPRs --
//! fine for a handler that always panics, but not for one that must resume a *different* task's
//! registers when the fault came from ring 3. This trampoline is built the same way
//! `interrupts::syscall::entry` is: a naked prologue saves every GPR in `sched::task::Registers`
//! order, then Rust code decides whether to kill the faulting task (ring 3) or fall through to
//! the ordinary fatal-dump path (ring 0 -- a GPF in kernel code is a kernel bug, not something a
//! single task's isolation can absorb).

use x86_64::structures::idt::InterruptStackFrame;

use crate::sched::task::Registers;
use crate::sched::RawIsf;

/// Installed at IDT vector 13 (`#GP`) via the ordinary `set_handler_fn`; the signature matches
/// the CPU's error-code-bearing gate shape so it type-checks, but `#[naked]` means neither
/// parameter is ever actually read -- the hand-written prologue below walks the pushed frame
/// itself, exactly like `interrupts::syscall::entry`.
#[naked]
pub unsafe extern "x86-interrupt" fn entry(_frame: &mut InterruptStackFrame, _error_code: u64) {
    asm!(
        "pushq %r15
         pushq %r14
         pushq %r13
         pushq %r12
         pushq %r11
         pushq %r10
         pushq %r9
         pushq %r8
         pushq %rbp
         pushq %rdi
         pushq %rsi
         pushq %rdx
         pushq %rcx
         pushq %rbx
         pushq %rax
         movq %rsp, %rdi
         callq gpf_from_registers
         popq %rax
         popq %rbx
         popq %rcx
         popq %rdx
         popq %rsi
         popq %rdi
         popq %rbp
         popq %r8
         popq %r9
         popq %r10
         popq %r11
         popq %r12
         popq %r13
         popq %r14
         popq %r15
         addq $8, %rsp
         iretq"
        :::: "volatile"
    );
}

/// The ring-3 code/stack selectors carry RPL 3 in their low two bits (the standard x86
/// convention); a fault whose saved `cs` has RPL < 3 happened in kernel code.
const RPL_MASK: u64 = 0b11;

#[no_mangle]
extern "C" fn gpf_from_registers(regs: *mut Registers) {
    let isf = unsafe { &mut *((regs as *mut u8).add(core::mem::size_of::<Registers>() + 8) as *mut RawIsf) };
    let error_code = unsafe { *((regs as *const u8).add(core::mem::size_of::<Registers>()) as *const u64) };

    if isf.cs & RPL_MASK == 3 {
        let pid = crate::sched::current_pid();
        printk!(
            "#GP in pid {} (error {:#x}, rip {:#x}): terminating task\n",
            pid,
            error_code,
            isf.rip,
        );
        unsafe {
            crate::sched::kill_current_and_switch(regs, isf as *mut RawIsf);
        }
    } else {
        panic!(
            "General Protection Fault in kernel mode\n  error: {:#x}\n  rip: {:#x}\n  cs: {:#x}",
            error_code, isf.rip, isf.cs,
        );
    }
}
