//! Kernel log with buffering
//!
//! Messages are stored in a ring buffer so logging always works, even
//! before a console exists. Once a console sink is registered, buffered
//! messages can be flushed and new messages go to the sink directly.
//!
//! The buffer lock is held only for the copy into the ring; sink I/O runs
//! under a separate lock so a slow UART cannot interleave messages from
//! two CPUs.

use core::fmt::{self, Write};

use spin::Mutex;

/// Ring buffer size (must be a power of two)
const LOG_BUFFER_SIZE: usize = 16384;

/// Console sink trait
///
/// Implemented by whatever the platform uses for log output (a 16550 UART
/// on x86_64). Writes must not block on task state: the sink is called
/// from interrupt context.
pub trait Console: Send {
    fn write_bytes(&mut self, bytes: &[u8]);
}

struct RingBuffer {
    data: [u8; LOG_BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            data: [0; LOG_BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    fn write_byte(&mut self, byte: u8) {
        self.data[self.head] = byte;
        self.head = (self.head + 1) & (LOG_BUFFER_SIZE - 1);
        if self.head == self.tail {
            // Overwrote the oldest byte
            self.tail = (self.tail + 1) & (LOG_BUFFER_SIZE - 1);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while self.tail != self.head && count < buf.len() {
            buf[count] = self.data[self.tail];
            self.tail = (self.tail + 1) & (LOG_BUFFER_SIZE - 1);
            count += 1;
        }
        count
    }
}

static LOG_BUFFER: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

/// Registered console sink; log output goes here once set
static CONSOLE: Mutex<Option<&'static mut dyn Console>> = Mutex::new(None);

/// Register the console sink and flush buffered boot messages to it
pub fn register_console(console: &'static mut dyn Console) {
    *CONSOLE.lock() = Some(console);
    flush();
}

/// Flush buffered messages to the registered console
pub fn flush() {
    let mut chunk = [0u8; 256];
    loop {
        let n = LOG_BUFFER.lock().drain(&mut chunk);
        if n == 0 {
            break;
        }
        if let Some(console) = CONSOLE.lock().as_mut() {
            console.write_bytes(&chunk[..n]);
        }
    }
}

/// Write raw bytes to the console sink, bypassing the log buffer
///
/// Terminal output goes here so it does not clutter the kernel log.
/// Dropped silently when no console is registered yet.
pub fn console_write(bytes: &[u8]) {
    if let Some(console) = CONSOLE.lock().as_mut() {
        console.write_bytes(bytes);
    }
}

struct LogWriter;

impl Write for LogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        LOG_BUFFER.lock().write_bytes(s.as_bytes());
        if let Some(console) = CONSOLE.lock().as_mut() {
            console.write_bytes(s.as_bytes());
        }
        Ok(())
    }
}

/// Write formatted output to the kernel log
///
/// Used by the `printkln!` macro; call that instead.
pub fn log_fmt(args: fmt::Arguments) {
    let _ = LogWriter.write_fmt(args);
}

/// Log a line to the kernel log buffer (and console, if registered)
#[macro_export]
macro_rules! printkln {
    () => {
        $crate::printk::log_fmt(format_args!("\n"))
    };
    ($($arg:tt)*) => {{
        $crate::printk::log_fmt(format_args!($($arg)*));
        $crate::printk::log_fmt(format_args!("\n"));
    }};
}
