//! This module contains some basic functionality that libstd would normally otherwise provide.
//! Most importantly, it defines the panic handler, which renders the §7 "fatal machine error"
//! blue-screen-style dump and halts with interrupts disabled.

use core::panic::PanicInfo;

use x86_64::instructions::interrupts;

#[lang = "eh_personality"]
#[no_mangle]
pub fn eh_personality() {}

/// This function is used by `panic!` to display an error message and halt forever.
///
/// Every fatal machine error (§7) funnels through here: unrecoverable exceptions, allocator
/// exhaustion, and double faults all `panic!` with a descriptive message rather than trying to
/// unwind, since there is no unwinder in a `#![no_std]` kernel.
#[panic_handler]
fn rust_begin_panic(info: &PanicInfo) -> ! {
    // We should not be interrupting any more.
    interrupts::disable();

    printk!("\n========{{ PANIC }}========\n");
    if let Some(location) = info.location() {
        printk!("{}:{}:{}\n", location.file(), location.line(), location.column());
    }
    printk!("...........................\n");
    printk!("{}\n", info.message());
    printk!("===========================\n");

    loop {
        x86_64::instructions::hlt();
    }
}
