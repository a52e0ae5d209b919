//! Per-CPU scheduler slots
//!
//! Each CPU finds its own scheduler through its logical id, which is
//! parked in `IA32_TSC_AUX` during bring-up and read back with `rdtscp`.
//! The slots are written once per CPU at boot and thereafter only
//! dereferenced from that CPU's interrupt context.

use core::arch::asm;
use core::cell::UnsafeCell;

use super::KernelScheduler;

/// Maximum CPUs supported
pub const MAX_CPUS: usize = 16;

/// CPU id register used to stash the logical id at bring-up
const IA32_TSC_AUX: u32 = 0xC000_0103;

struct SchedulerSlot(UnsafeCell<*mut KernelScheduler>);

// Slots are written once during bring-up of their own CPU
unsafe impl Sync for SchedulerSlot {}

static SCHEDULERS: [SchedulerSlot; MAX_CPUS] = {
    const SLOT: SchedulerSlot = SchedulerSlot(UnsafeCell::new(core::ptr::null_mut()));
    [SLOT; MAX_CPUS]
};

/// Logical id of the executing CPU
pub fn current_cpu_id() -> u32 {
    let aux: u64;
    unsafe {
        asm!(
            "rdtscp",
            out("rcx") aux,
            out("rax") _,
            out("rdx") _,
            options(nomem, nostack, preserves_flags)
        );
    }
    aux as u32
}

/// Stamp the logical CPU id so `current_cpu_id` can find it
///
/// # Safety
/// Must run on the CPU being initialized, before its scheduler is used.
pub unsafe fn set_current_cpu_id(cpu: u32) {
    unsafe { super::wrmsr(IA32_TSC_AUX, cpu as u64) };
}

/// Install this CPU's scheduler
///
/// # Safety
/// `scheduler` must stay valid for the rest of the kernel's life and
/// `cpu` must be this CPU's logical id.
pub unsafe fn install_scheduler(cpu: u32, scheduler: *mut KernelScheduler) {
    unsafe { *SCHEDULERS[cpu as usize].0.get() = scheduler };
}

/// Run `f` against the executing CPU's scheduler
///
/// The scheduler is only ever entered from interrupt context with
/// interrupts disabled, which serializes access on this CPU. The
/// voluntary reschedule interrupt re-enters while an outer caller is
/// parked on the task's kernel stack; that outer frame does not touch
/// the scheduler again until it is resumed, so the accesses never
/// actually overlap.
///
/// # Safety
/// Must only be called from interrupt context after `install_scheduler`
/// ran on this CPU.
pub unsafe fn with_scheduler<R>(f: impl FnOnce(&mut KernelScheduler) -> R) -> R {
    let slot = unsafe { *SCHEDULERS[current_cpu_id() as usize].0.get() };
    debug_assert!(!slot.is_null(), "scheduler not installed on this cpu");
    f(unsafe { &mut *slot })
}
