//! A trivial FAT12 payload: prints its PID, waits for a keypress, then exits. Used to exercise
//! `execute` end to end, not a shell.

#![no_std]
#![no_main]
#![feature(start)]

use libuser::{exit, getchar, getpid, printf};

#[macro_use]
extern crate libuser;

panic_handler!();

#[no_mangle]
pub extern "C" fn main() -> isize {
    printf("hello from pid \0");
    print_usize(getpid());
    printf("\npress any key...\n\0");

    loop {
        let c = getchar();
        if c != 0 {
            break;
        }
    }

    exit(0)
}

/// No `core::fmt` formatting is wired up for user programs yet, so numbers are printed by hand.
fn print_usize(mut n: usize) {
    if n == 0 {
        printf("0\0");
        return;
    }
    // Leave room for a trailing nul the kernel's `printf` syscall requires.
    let mut buf = [0u8; 21];
    let mut i = buf.len() - 1;
    while n > 0 {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    // SAFETY: the slice is ASCII digits followed by the nul left in `buf`'s last byte.
    let s = unsafe { core::str::from_utf8_unchecked(&buf[i..]) };
    printf(s);
}
