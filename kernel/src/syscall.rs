//! The syscall dispatch table (§4.6, §6) -- sixteen operations reachable via `int 0x80`, matched
//! on the number the trap gateway (`interrupts::syscall::entry`) pulled out of `rax`. Every
//! pointer argument here is a user-space address in the *calling task's own* address space: the
//! dispatcher runs without switching CR3, so dereferencing it directly is sound as long as the
//! page it points at is actually mapped (if it isn't, the page fault handler's ordinary fatal path
//! applies -- same as it would for any other bad pointer dereference in kernel code).

use alloc::vec::Vec;

use crate::fs::{fat12, fd, loader};
use crate::interrupts::kbd;
use crate::io::vga;
use crate::sched;
use crate::sched::task::Registers;
use crate::sched::RawIsf;

const SYS_PRINTF: u64 = 1;
const SYS_GETPID: u64 = 2;
const SYS_TERMINATE: u64 = 3;
const SYS_GETCHAR: u64 = 4;
const SYS_GETCURSOR: u64 = 5;
const SYS_SETCURSOR: u64 = 6;
const SYS_EXECUTE: u64 = 7;
const SYS_PRINT_ROOT_DIR: u64 = 8;
const SYS_CLEAR_SCREEN: u64 = 9;
const SYS_OPEN: u64 = 10;
const SYS_READ: u64 = 11;
const SYS_WRITE: u64 = 12;
const SYS_SEEK: u64 = 13;
const SYS_EOF: u64 = 14;
const SYS_CLOSE: u64 = 15;
const SYS_DELETE: u64 = 16;

/// Longest string `printf` will ever copy out of user space in one call -- a runaway/missing nul
/// terminator stops here rather than reading off into unmapped memory forever.
const MAX_PRINTF_LEN: usize = 4096;

/// Read a nul-terminated byte string starting at `ptr`, up to `MAX_PRINTF_LEN` bytes.
unsafe fn read_cstr(ptr: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut p = ptr as *const u8;
    while out.len() < MAX_PRINTF_LEN {
        let b = core::ptr::read(p);
        if b == 0 {
            break;
        }
        out.push(b);
        p = p.add(1);
    }
    out
}

unsafe fn read_name8(ptr: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), 8);
    buf
}

unsafe fn read_ext3(ptr: u64) -> [u8; 3] {
    let mut buf = [0u8; 3];
    core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), 3);
    buf
}

/// Dispatch one syscall. `regs`/`isf` are only touched by `terminate`, which must drive a context
/// switch rather than return normally (§4.5 "Terminate(PID)"); every other arm just computes a
/// return value for `interrupts::syscall::entry`'s trampoline to place in `rax`.
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    regs: *mut Registers,
    isf: *mut RawIsf,
    num: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    _a4: u64,
    _a5: u64,
) -> u64 {
    match num {
        SYS_PRINTF => {
            let bytes = unsafe { read_cstr(a1) };
            match core::str::from_utf8(&bytes) {
                Ok(s) => vga::write_str(s),
                Err(_) => vga::write_str("<printf: invalid utf8>"),
            }
            0
        }

        SYS_GETPID => sched::current_pid(),

        SYS_TERMINATE => unsafe { sched::terminate_current_and_switch(regs, isf) },

        SYS_GETCHAR => kbd::getchar() as u64,

        SYS_GETCURSOR => {
            let (row, col) = vga::get_cursor();
            unsafe {
                core::ptr::write(a1 as *mut u8, row);
                core::ptr::write(a2 as *mut u8, col);
            }
            0
        }

        SYS_SETCURSOR => {
            vga::set_cursor(a1 as u8, a2 as u8);
            0
        }

        SYS_EXECUTE => {
            let mut name83 = [0u8; 11];
            unsafe { core::ptr::copy_nonoverlapping(a1 as *const u8, name83.as_mut_ptr(), 11) };
            if loader::request_execute(name83) {
                1
            } else {
                0
            }
        }

        SYS_PRINT_ROOT_DIR => {
            for (name, ext, size) in fat12::list() {
                vga::write_str(core::str::from_utf8(&name).unwrap_or("????????"));
                vga::write_str(".");
                vga::write_str(core::str::from_utf8(&ext).unwrap_or("???"));
                vga::write_str(" ");
                print_decimal(size as u64);
                vga::write_str("\n");
            }
            0
        }

        SYS_CLEAR_SCREEN => {
            vga::clear_screen();
            0
        }

        SYS_OPEN => {
            let name8 = unsafe { read_name8(a1) };
            let ext3 = unsafe { read_ext3(a2) };
            match fat12::find(&name8, &ext3) {
                Some((root_entry, file_size)) => {
                    fd::open(&name8, &ext3, sched::current_pid(), root_entry, file_size)
                }
                None => 0,
            }
        }

        SYS_READ => {
            let handle = a1;
            let buf = unsafe { core::slice::from_raw_parts_mut(a2 as *mut u8, a3 as usize) };
            fd::with(handle, |desc| {
                let n = fat12::read(desc.root_entry, desc.offset, buf);
                desc.offset += n;
                n as u64
            })
            .unwrap_or(0)
        }

        SYS_WRITE => {
            let handle = a1;
            let buf = unsafe { core::slice::from_raw_parts(a2 as *const u8, a3 as usize) };
            fd::with(handle, |desc| {
                let n = fat12::write(desc.root_entry, desc.offset, buf);
                desc.offset += n;
                desc.file_size = desc.file_size.max((desc.offset) as u32);
                n as u64
            })
            .unwrap_or(0)
        }

        SYS_SEEK => {
            let handle = a1;
            let offset = a2 as usize;
            fd::with(handle, |desc| desc.offset = offset);
            0
        }

        SYS_EOF => {
            let handle = a1;
            fd::with(handle, |desc| (desc.offset >= desc.file_size as usize) as u64).unwrap_or(1)
        }

        SYS_CLOSE => {
            fd::close(a1);
            0
        }

        SYS_DELETE => {
            let name8 = unsafe { read_name8(a1) };
            let ext3 = unsafe { read_ext3(a2) };
            fat12::delete(&name8, &ext3) as u64
        }

        _ => {
            printk!("syscall: unknown number {}\n", num);
            u64::MAX
        }
    }
}

/// `print-root-dir` needs to render a `u32` without `core::fmt` pulling in more than this teaching
/// kernel's console wants to depend on -- the teacher's own `printk!` already goes through
/// `core::fmt`, but this one path writes straight to `vga` a digit at a time the way
/// `original_source/main64/kernel/io/fat12.c`'s listing command does.
fn print_decimal(mut n: u64) {
    if n == 0 {
        vga::write_str("0");
        return;
    }
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    while n > 0 {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    vga::write_str(core::str::from_utf8(&digits[i..]).unwrap());
}
