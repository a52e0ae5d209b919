//! Local APIC one-shot timer
//!
//! Each CPU owns its LAPIC. The core only needs three things from it:
//! arm a one-shot countdown in milliseconds, report how much of the
//! armed interval is left, and acknowledge the timer interrupt.
//!
//! The tick rate is calibrated once on the BSP against the PIT and
//! shared with the application processors.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::phys_to_virt;

use super::io::{inb, outb};
use super::rdmsr;

const LAPIC_BASE_MSR: u32 = 0x1B;

const LAPIC_EOI: u64 = 0x0B0;
const LAPIC_SPURIOUS: u64 = 0x0F0;
const LAPIC_TIMER_LVT: u64 = 0x320;
const LAPIC_TIMER_DIVIDE: u64 = 0x3E0;
const LAPIC_TIMER_INITIAL: u64 = 0x380;
const LAPIC_TIMER_CURRENT: u64 = 0x390;

/// One-shot, unmasked, delivered on the scheduler vector
const TIMER_LVT_ONE_SHOT: u32 = crate::arch::TIMER_VECTOR as u32;
/// One-shot but masked, used while calibrating
const TIMER_LVT_MASKED: u32 = (1 << 16) | crate::arch::TIMER_VECTOR as u32;

/// PIT runs at this fixed rate
const PIT_FREQUENCY: u64 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Calibrated LAPIC timer ticks per millisecond (BSP measures, APs copy)
static TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

/// Per-CPU local APIC handle
pub struct Lapic {
    base: u64,
}

impl Lapic {
    /// Map this CPU's LAPIC through the higher half and enable it
    ///
    /// # Safety
    /// Requires the higher-half alias to cover the LAPIC MMIO page and
    /// must run with interrupts disabled.
    pub unsafe fn init() -> Self {
        let base = phys_to_virt(rdmsr(LAPIC_BASE_MSR) & !0xFFF);
        let lapic = Self { base };
        // Software-enable with the spurious vector at 255
        lapic.write(LAPIC_SPURIOUS, 0x1FF);
        // Divide-by-2 tick rate
        lapic.write(LAPIC_TIMER_DIVIDE, 0);
        lapic
    }

    fn read(&self, offset: u64) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: u64, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Acknowledge the in-service interrupt
    pub fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    /// Arm the one-shot countdown for `ms` milliseconds
    pub fn arm_one_shot_ms(&self, ms: u64) {
        let ticks = TICKS_PER_MS.load(Ordering::Relaxed).max(1) * ms.max(1);
        self.write(LAPIC_TIMER_LVT, TIMER_LVT_ONE_SHOT);
        self.write(LAPIC_TIMER_INITIAL, ticks.min(u32::MAX as u64) as u32);
    }

    /// Milliseconds left of the armed interval
    pub fn remaining_ms(&self) -> u64 {
        let ticks = self.read(LAPIC_TIMER_CURRENT) as u64;
        ticks / TICKS_PER_MS.load(Ordering::Relaxed).max(1)
    }

    /// Measure the timer tick rate against the PIT (BSP, once)
    ///
    /// Runs the LAPIC countdown from a known value and times it with
    /// PIT channel 0 in rate mode.
    pub fn calibrate(&self) {
        if TICKS_PER_MS.load(Ordering::Relaxed) != 0 {
            return;
        }
        const SAMPLE_TICKS: u32 = 0xFFFFF;

        self.write(LAPIC_TIMER_LVT, TIMER_LVT_MASKED);

        // PIT channel 0, lobyte/hibyte, mode 2, maximum reload value
        unsafe {
            outb(PIT_COMMAND, 0x34);
            outb(PIT_CHANNEL0, 0xFF);
            outb(PIT_CHANNEL0, 0xFF);
        }
        let start = pit_read();

        self.write(LAPIC_TIMER_INITIAL, SAMPLE_TICKS);
        while self.read(LAPIC_TIMER_CURRENT) != 0 {
            core::hint::spin_loop();
        }

        let end = pit_read();
        self.write(LAPIC_TIMER_INITIAL, 0);

        let pit_ticks = start.wrapping_sub(end) as u64 & 0xFFFF;
        let lapic_hz = SAMPLE_TICKS as u64 * PIT_FREQUENCY / pit_ticks.max(1);
        TICKS_PER_MS.store((lapic_hz / 1000).max(1), Ordering::Relaxed);
    }
}

fn pit_read() -> u16 {
    unsafe {
        // Latch channel 0, then read low/high
        outb(PIT_COMMAND, 0x00);
        let low = inb(PIT_CHANNEL0) as u16;
        let high = inb(PIT_CHANNEL0) as u16;
        (high << 8) | low
    }
}
