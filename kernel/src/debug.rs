//! This module allows the kernel to print to QEMU's serial console.
//!
//! Borrowed in spirit from krzysz00/rust-kernel/kernel/console.rs: a bare `core::fmt::Write`
//! impl over the UART, used as the kernel's only logging facility.

use core::fmt::{Error, Write};

use x86_64::instructions::port::Port;

/// Port to output to serial console
const PORT: u16 = 0x3F8;

/// Line status register offset: bit 5 set means the transmit buffer is empty.
const LINE_STATUS_OFFSET: u16 = 5;
const LINE_STATUS_EMPTY: u8 = 0x20;

/// A struct to write data to the console port
pub struct Debug;

impl Debug {
    /// Wait for the port, then write the given array of bytes
    pub fn write_bytes(&self, bytes: &[u8]) {
        let data: Port<u8> = Port::new(PORT);
        let status: Port<u8> = Port::new(PORT + LINE_STATUS_OFFSET);
        for &b in bytes {
            unsafe {
                while status.read() & LINE_STATUS_EMPTY == 0 {}
                data.write(b);
            }
        }
    }
}

/// Implement `Write` so that we can use format strings
impl Write for Debug {
    /// Take a string slice and write to the serial console
    #[inline]
    fn write_str(&mut self, data: &str) -> Result<(), Error> {
        self.write_bytes(data.as_bytes());
        Result::Ok(())
    }
}

/// A macro for printing using format strings to the console, used by every subsystem's init
/// routine and by the fatal-exception dump.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => ({
        use ::core::fmt::Write;
        let _ = write!($crate::debug::Debug, $($arg)*);
    })
}
