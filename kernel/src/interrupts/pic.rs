//! A module for the programmable interrupt controller (8259 PIC pair).

use x86_64::{
    instructions::{interrupts, port::Port},
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame},
};

use crate::time;

/// Command port for PIC1
const C1: Port<u8> = Port::new(0x20);

/// Data port for PIC1
const D1: Port<u8> = Port::new(0x21);

/// Command port for PIC2
const C2: Port<u8> = Port::new(0xA0);

/// Data port for PIC2
const D2: Port<u8> = Port::new(0xA1);

/// The first entries of the IDT are reserved for traps and exceptions, so IRQ0 is remapped here.
const FIRST_IDT: u8 = 0x20;

/// Initialize some interrupt handlers
pub fn init_irqs(idt: &mut InterruptDescriptorTable) {
    idt[FIRST_IDT as usize].set_handler_fn(irq_0);
    idt[FIRST_IDT as usize + 0x1].set_handler_fn(irq_1);
    idt[FIRST_IDT as usize + 0x2].set_handler_fn(irq_2);
    idt[FIRST_IDT as usize + 0x3].set_handler_fn(irq_3);
    idt[FIRST_IDT as usize + 0x4].set_handler_fn(irq_4);
    idt[FIRST_IDT as usize + 0x5].set_handler_fn(irq_5);
    idt[FIRST_IDT as usize + 0x6].set_handler_fn(irq_6);
    idt[FIRST_IDT as usize + 0x7].set_handler_fn(irq_7);
    idt[FIRST_IDT as usize + 0x8].set_handler_fn(irq_8);
    idt[FIRST_IDT as usize + 0x9].set_handler_fn(irq_9);
    idt[FIRST_IDT as usize + 0xa].set_handler_fn(irq_a);
    idt[FIRST_IDT as usize + 0xb].set_handler_fn(irq_b);
    idt[FIRST_IDT as usize + 0xc].set_handler_fn(irq_c);
    idt[FIRST_IDT as usize + 0xd].set_handler_fn(irq_d);
    idt[FIRST_IDT as usize + 0xe].set_handler_fn(irq_e);
    idt[FIRST_IDT as usize + 0xf].set_handler_fn(irq_f);

    // Good for debugging
    idt.breakpoint.set_handler_fn(breakpoint_handler);
}

/// The command/data port and byte value `init` writes, in order: ICW1 (both PICs), ICW2, ICW3,
/// ICW4, then the unmask-all write. Kept as a pure, data-driven sequence -- rather than the writes
/// inlined directly in `init` -- so the handshake can be pinned down in a host-run test against a
/// recorded port/value trace instead of real hardware.
const ICW_SEQUENCE: [(u16, u8); 10] = [
    (0x20, 0x11),            // ICW1 master: init with ICW4, not single
    (0xA0, 0x11),            // ICW1 slave: init with ICW4, not single
    (0x21, FIRST_IDT),       // ICW2 master: IDT index for IRQ0
    (0xA1, FIRST_IDT + 8),   // ICW2 slave: IDT index for IRQ8
    (0x21, 1 << 2),          // ICW3 master: slave is at IRQ2
    (0xA1, 2),               // ICW3 slave: connected at IRQ2
    (0x21, 1),               // ICW4 master: 8086 mode
    (0xA1, 1),               // ICW4 slave: 8086 mode
    (0x21, 0),               // unmask all, master
    (0xA1, 0),               // unmask all, slave
];

/// Initialize the PIC, but leave interrupts disabled
pub fn init() {
    unsafe {
        for &(port, value) in ICW_SEQUENCE.iter() {
            Port::<u8>::new(port).write(value);
        }
    }
}

/// End of interrupt: send the next irq, but interrupts still disabled. Timer vector 0's naked
/// trampoline (below) calls this directly since it bypasses `pic_irq`.
pub(crate) fn eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            // let PIC2 know
            C2.write(0x20);
        }
        // we always let PIC1 know because PIC2 is routed though PIC1
        C1.write(0x20);
    }
}

/// IRQ handler for every vector except the timer (IRQ0, handled by a naked trampoline below
/// because preemption needs GPR access this ordinary `extern "x86-interrupt"` shape can't give).
///
/// For more info on IRQ handlers: https://wiki.osdev.org/Interrupts
///
/// Note that this should _not_ be confused with _exceptions_. For more info on x86 exceptions, see
/// https://wiki.osdev.org/Exceptions
fn pic_irq(irq: usize, _: &mut InterruptStackFrame) {
    match irq {
        // Keyboard interrupts
        1 => {
            crate::interrupts::kbd::handler();
        }

        // Processor and FPU interrupts
        13 => {}

        // IDE interrupts
        14 | 15 => {}

        // Other (unknown) interrupts
        _ => {
            interrupts::disable();
            panic!("unknown interrupt {}\n", irq)
        }
    }

    // the PIC can deliver the next interrupt, but interrupts are still disabled
    eoi(irq as u8);
}

////////////////////////////////////////////////////////////////////////////////
// The interrupt handlers
//
// These are called by the hardware. They simply call `pic_irq`, which does the
// hard work for them.
////////////////////////////////////////////////////////////////////////////////

/// IRQ0 (the PIT, 250Hz) is the preemption tick: unlike every other IRQ it must reach into the
/// interrupted task's GPRs to stage a different task in their place, so it can't go through the
/// ordinary `extern "x86-interrupt" fn(&mut InterruptStackFrame)` shape `pic_irq` expects -- that
/// calling convention saves/restores GPRs transparently and never exposes them to the handler
/// body. This naked prologue saves them in `sched::task::Registers` order itself, the same
/// technique `interrupts::syscall::entry` and `interrupts::gpf::entry` use.
#[naked]
unsafe extern "x86-interrupt" fn irq_0(_esf: &mut InterruptStackFrame) {
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
         callq timer_tick_from_registers
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

/// No error code on this vector, so the CPU-pushed frame sits directly above the GPR block this
/// trampoline just pushed -- same offset convention as `interrupts::syscall::entry`.
#[no_mangle]
extern "C" fn timer_tick_from_registers(regs: *mut crate::sched::task::Registers) {
    time::tick();
    let isf = unsafe {
        &mut *((regs as *mut u8).add(core::mem::size_of::<crate::sched::task::Registers>())
            as *mut crate::sched::RawIsf)
    };
    unsafe {
        crate::sched::on_tick(regs, isf as *mut crate::sched::RawIsf);
    }
    eoi(0);
}

extern "x86-interrupt" fn irq_1(esf: &mut InterruptStackFrame) {
    pic_irq(1, esf);
}

extern "x86-interrupt" fn irq_2(esf: &mut InterruptStackFrame) {
    pic_irq(2, esf);
}

extern "x86-interrupt" fn irq_3(esf: &mut InterruptStackFrame) {
    pic_irq(3, esf);
}

extern "x86-interrupt" fn irq_4(esf: &mut InterruptStackFrame) {
    pic_irq(4, esf);
}

extern "x86-interrupt" fn irq_5(esf: &mut InterruptStackFrame) {
    pic_irq(5, esf);
}

extern "x86-interrupt" fn irq_6(esf: &mut InterruptStackFrame) {
    pic_irq(6, esf);
}

extern "x86-interrupt" fn irq_7(esf: &mut InterruptStackFrame) {
    pic_irq(7, esf);
}

extern "x86-interrupt" fn irq_8(esf: &mut InterruptStackFrame) {
    pic_irq(8, esf);
}

extern "x86-interrupt" fn irq_9(esf: &mut InterruptStackFrame) {
    pic_irq(9, esf);
}

extern "x86-interrupt" fn irq_a(esf: &mut InterruptStackFrame) {
    pic_irq(0xa, esf);
}

extern "x86-interrupt" fn irq_b(esf: &mut InterruptStackFrame) {
    pic_irq(0xb, esf);
}

extern "x86-interrupt" fn irq_c(esf: &mut InterruptStackFrame) {
    pic_irq(0xc, esf);
}

extern "x86-interrupt" fn irq_d(esf: &mut InterruptStackFrame) {
    pic_irq(0xd, esf);
}

extern "x86-interrupt" fn irq_e(esf: &mut InterruptStackFrame) {
    pic_irq(0xe, esf);
}

extern "x86-interrupt" fn irq_f(esf: &mut InterruptStackFrame) {
    pic_irq(0xf, esf);
}

/// Handle a breakpoint exception
extern "x86-interrupt" fn breakpoint_handler(stack_frame: &mut InterruptStackFrame) {
    panic!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icw_sequence_matches_the_standard_8259_handshake() {
        assert_eq!(
            ICW_SEQUENCE,
            [
                (0x20, 0x11),
                (0xA0, 0x11),
                (0x21, FIRST_IDT),
                (0xA1, FIRST_IDT + 8),
                (0x21, 1 << 2),
                (0xA1, 2),
                (0x21, 1),
                (0xA1, 1),
                (0x21, 0),
                (0xA1, 0),
            ]
        );
    }

    #[test]
    fn icw2_entries_place_irq0_and_irq8_at_the_remapped_vectors() {
        let (master_port, master_vector) = ICW_SEQUENCE[2];
        let (slave_port, slave_vector) = ICW_SEQUENCE[3];
        assert_eq!(master_port, 0x21);
        assert_eq!(master_vector, FIRST_IDT);
        assert_eq!(slave_port, 0xA1);
        assert_eq!(slave_vector, FIRST_IDT + 8);
    }
}
