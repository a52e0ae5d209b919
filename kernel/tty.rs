//! Pseudo-terminal device
//!
//! `/dev/tty` is a character device with a blocking read side fed by the
//! keyboard interrupt and a non-blocking write side that goes straight
//! to the console. Line discipline is out of scope; bytes pass through
//! unmodified, and terminal settings are stored for userspace round
//! trips only.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};
use crate::fs::devfs::CharDevice;
use crate::printk::console_write;
use crate::task::Pid;
use crate::waitqueue::WaitQueue;

/// Terminal settings as handed over by `SetTerminalSettings`
///
/// Sixteen bytes, mirroring the four termios flag words. The kernel only
/// stores them; interpretation is left to userspace convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TermSettings {
    pub input_flags: u32,
    pub output_flags: u32,
    pub control_flags: u32,
    pub local_flags: u32,
}

/// The terminal device
pub struct Tty {
    input: Mutex<VecDeque<u8>>,
    readers: WaitQueue,
    settings: Mutex<TermSettings>,
}

impl Tty {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            readers: WaitQueue::new(),
            settings: Mutex::new(TermSettings::default()),
        }
    }

    /// Feed one input byte from the keyboard interrupt path
    ///
    /// Returns the PID of a blocked reader that should be unsuspended,
    /// if any. The caller owns the wakeup so this stays callable from
    /// any CPU's interrupt context.
    pub fn push_input(&self, byte: u8) -> Option<Pid> {
        self.input.lock().push_back(byte);
        self.readers.take_one()
    }

    pub fn set_settings(&self, settings: TermSettings) {
        *self.settings.lock() = settings;
    }

    pub fn settings(&self) -> TermSettings {
        *self.settings.lock()
    }
}

impl Default for Tty {
    fn default() -> Self {
        Self::new()
    }
}

impl CharDevice for Tty {
    fn name(&self) -> &str {
        "tty"
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut input = self.input.lock();
        if input.is_empty() {
            return Err(KernelError::WouldBlock);
        }
        let count = buf.len().min(input.len());
        for slot in buf.iter_mut().take(count) {
            *slot = input.pop_front().unwrap();
        }
        Ok(count)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        console_write(buf);
        Ok(buf.len())
    }

    fn read_queue(&self) -> Option<&WaitQueue> {
        Some(&self.readers)
    }

    fn set_terminal_settings(&self, raw: [u8; 16]) -> KernelResult<()> {
        let word = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        self.set_settings(TermSettings {
            input_flags: word(0),
            output_flags: word(1),
            control_flags: word(2),
            local_flags: word(3),
        });
        Ok(())
    }
}

/// The boot-registered terminal, reachable from the keyboard interrupt
static TTY: Once<Arc<Tty>> = Once::new();

/// Create (once) and return the kernel terminal
pub fn init() -> Arc<Tty> {
    TTY.call_once(|| Arc::new(Tty::new())).clone()
}

/// The kernel terminal, if initialized
pub fn the() -> Option<Arc<Tty>> {
    TTY.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_empty_would_block() {
        let tty = Tty::new();
        let mut buf = [0u8; 4];
        assert_eq!(tty.read(&mut buf), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_push_then_read() {
        let tty = Tty::new();
        assert_eq!(tty.push_input(b'x'), None);
        let mut buf = [0u8; 4];
        assert_eq!(tty.read(&mut buf), Ok(1));
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn test_push_wakes_registered_reader() {
        let tty = Tty::new();
        tty.read_queue().unwrap().register(42);
        assert_eq!(tty.push_input(b'x'), Some(42));
        // Only one wake per waiter
        assert_eq!(tty.push_input(b'y'), None);
    }

    #[test]
    fn test_short_read_drains_in_order() {
        let tty = Tty::new();
        for byte in *b"abc" {
            tty.push_input(byte);
        }
        let mut buf = [0u8; 2];
        assert_eq!(tty.read(&mut buf), Ok(2));
        assert_eq!(&buf, b"ab");
        assert_eq!(tty.read(&mut buf), Ok(1));
        assert_eq!(buf[0], b'c');
    }

    #[test]
    fn test_settings_roundtrip() {
        let tty = Tty::new();
        let settings = TermSettings {
            input_flags: 1,
            output_flags: 2,
            control_flags: 3,
            local_flags: 4,
        };
        tty.set_settings(settings);
        assert_eq!(tty.settings(), settings);
        assert_eq!(core::mem::size_of::<TermSettings>(), 16);
    }
}
