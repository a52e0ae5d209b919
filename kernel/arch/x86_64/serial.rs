//! Serial console sink
//!
//! COM1 via the `uart_16550` crate, registered with printk during boot
//! so buffered log lines reach the outside world.

use alloc::boxed::Box;

use uart_16550::SerialPort;

use crate::printk::Console;

const COM1: u16 = 0x3F8;

/// Console adapter over the UART driver
pub struct SerialConsole {
    port: SerialPort,
}

impl Console for SerialConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.port.send(b'\r');
            }
            self.port.send(byte);
        }
    }
}

/// Initialize COM1 and return the console sink for registration
///
/// The console lives for the rest of the kernel's life.
///
/// # Safety
/// Must run exactly once, before any other use of the COM1 I/O ports.
pub unsafe fn init() -> &'static mut SerialConsole {
    let mut port = unsafe { SerialPort::new(COM1) };
    port.init();
    Box::leak(Box::new(SerialConsole { port }))
}
