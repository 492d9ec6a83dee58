//! The syscall trap (vector 0x80, DPL=3) — §4.4/§4.6.
//!
//! `extern "x86-interrupt"` functions only expose the CPU-pushed interrupt frame, not the
//! general-purpose registers the syscall ABI carries its number and arguments in. A naked
//! function captures every GPR onto the kernel stack in the same shape as a scheduler
//! `Registers` image (`sched::task::Registers`) before handing off to ordinary Rust, the same
//! split the teacher's IRQ trampolines (`interrupts::pic::irq_0`..`irq_f`) use for vectoring, just
//! one level lower since here the payload lives in registers rather than the interrupt frame.

use x86_64::structures::idt::InterruptStackFrame;

use crate::sched::task::Registers;
use crate::sched::RawIsf;

/// Installed at IDT vector 0x80 with DPL=3 so user mode can `int 0x80`.
///
/// Declared with the same `extern "x86-interrupt"` signature as an ordinary IRQ trampoline purely
/// so it type-checks against `idt[0x80].set_handler_fn`; `#[naked]` suppresses the compiler's
/// usual frame-saving prologue, and the frame parameter is never read because the hand-written
/// assembly below walks the CPU-pushed frame itself.
#[naked]
pub unsafe extern "x86-interrupt" fn entry(_frame: &mut InterruptStackFrame) {
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
         callq dispatch_from_registers
         movq %rax, (%rsp)
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
         iretq"
        :::: "volatile"
    );
}

/// Called from `entry` with a pointer to the just-saved register image. Reads the syscall
/// number out of `rax` and the argument registers per §4.6/§6 and dispatches. `regs`/`isf` are
/// passed through raw so that `terminate` (§4.6 "Terminate(PID)") can drive a context switch in
/// place of returning to the calling task -- no error-code word sits between the GPR block and
/// the CPU-pushed frame on this vector, unlike `gpf::entry`.
#[no_mangle]
extern "C" fn dispatch_from_registers(regs: *mut Registers) -> u64 {
    let isf = unsafe {
        &mut *((regs as *mut u8).add(core::mem::size_of::<Registers>()) as *mut RawIsf)
    };
    let (rax, rdi, rsi, rdx, r8, r9) = unsafe {
        let r = &*regs;
        (r.rax, r.rdi, r.rsi, r.rdx, r.r8, r.r9)
    };
    crate::syscall::dispatch(regs, isf as *mut RawIsf, rax, rdi, rsi, rdx, r8, r9)
}
