//! x86_64 platform implementation
//!
//! Concrete [`Platform`] for the scheduler (LAPIC one-shot timer, TSS
//! IST retarget, FS base, the voluntary reschedule interrupt), the
//! interrupt-dispatch entry the ISR stubs call, and CPU bring-up. The
//! IDT/GDT table contents and the ISR stubs themselves belong to the
//! boot collaborator; this module begins where an interrupt frame is
//! already on the kernel stack.

pub mod lapic;
pub mod percpu;
pub mod serial;
pub mod tss;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use core::arch::asm;

use crate::arch::{
    Platform, TrapFrame, KEYBOARD_VECTOR, RESCHEDULE_VECTOR, SYSCALL_VECTOR, TIMER_VECTOR,
};
use crate::mm::paging::X64AddressSpace;
use crate::printkln;
use crate::task::sched::{SchedRegistry, Scheduler};
use crate::task::SYSCALL_STACK_SIZE;
use crate::{fs, syscall, tty};

use lapic::Lapic;

/// The scheduler type every CPU runs
pub type KernelScheduler = Scheduler<X64Platform, X64AddressSpace>;
/// The registry shared by all CPUs
pub type KernelRegistry = SchedRegistry<X64AddressSpace>;

/// Exit status for tasks killed by a CPU exception
const FAULT_EXIT_STATUS: i32 = 139;

const IA32_FS_BASE: u32 = 0xC000_0100;

pub mod io {
    //! Port I/O primitives

    use core::arch::asm;

    /// # Safety
    /// Port must be safe to read in the current machine state.
    #[inline]
    pub unsafe fn inb(port: u16) -> u8 {
        let value: u8;
        unsafe {
            asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// # Safety
    /// Port must be safe to write in the current machine state.
    #[inline]
    pub unsafe fn outb(port: u16, value: u8) {
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
    }
}

use io::{inb, outb};

/// # Safety
/// MSR must exist on this CPU.
pub unsafe fn rdmsr(msr: u32) -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        asm!("rdmsr", in("ecx") msr, out("eax") low, out("edx") high, options(nomem, nostack, preserves_flags));
    }
    (high as u64) << 32 | low as u64
}

/// # Safety
/// MSR must exist and the value must be valid for it.
pub unsafe fn wrmsr(msr: u32, value: u64) {
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Per-CPU hardware surface handed to the scheduler
pub struct X64Platform {
    lapic: Lapic,
    cpu: u32,
}

impl Platform for X64Platform {
    fn timer_arm_one_shot(&mut self, ms: u64) {
        self.lapic.arm_one_shot_ms(ms);
    }

    fn timer_remaining_ms(&mut self) -> u64 {
        self.lapic.remaining_ms()
    }

    fn timer_acknowledge(&mut self) {
        self.lapic.send_eoi();
    }

    fn set_syscall_stack(&mut self, top: u64) {
        unsafe { tss::set_syscall_stack(self.cpu as usize, top) };
    }

    fn set_tls_base(&mut self, addr: u64) {
        unsafe { wrmsr(IA32_FS_BASE, addr) };
    }

    fn raise_reschedule(&mut self) -> u64 {
        let value: u64;
        unsafe {
            asm!("int 0x81", lateout("rax") value);
        }
        value
    }

    fn cpu_id(&self) -> u32 {
        self.cpu
    }
}

/// Idle loop every CPU's PID-0 task runs
extern "C" fn idle_loop() -> ! {
    loop {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}

/// Central interrupt dispatch, called by the ISR stubs with the saved
/// frame on the current task's kernel stack
///
/// # Safety
/// `frame` must point at a live interrupt frame and the executing CPU's
/// scheduler must be installed.
#[no_mangle]
pub unsafe extern "C" fn isr_handler(frame: &mut TrapFrame) {
    match frame.interrupt_number {
        TIMER_VECTOR => unsafe {
            percpu::with_scheduler(|sched| {
                sched.switch_to_next(frame);
                sched.timer_interrupt_done();
            });
        },
        KEYBOARD_VECTOR => {
            let byte = unsafe { inb(0x60) };
            if let Some(tty) = tty::the() {
                if let Some(reader) = tty.push_input(byte) {
                    let registry =
                        unsafe { percpu::with_scheduler(|sched| sched.registry()) };
                    registry.unsuspend(reader, 1);
                }
            }
            // Legacy PIC end-of-interrupt
            unsafe { outb(0x20, 0x20) };
        }
        SYSCALL_VECTOR => unsafe {
            percpu::with_scheduler(|sched| {
                fs::with_mount_table(|mounts| syscall::dispatch(sched, mounts, frame));
            });
        },
        RESCHEDULE_VECTOR => unsafe {
            percpu::with_scheduler(|sched| sched.switch_to_next(frame));
        },
        vector @ 0..=31 => handle_exception(vector, frame),
        vector => panic!("no handler for interrupt {:#x}", vector),
    }
}

fn handle_exception(vector: u64, frame: &mut TrapFrame) {
    printkln!(
        "exception {:#x} (error {:#x}) rip={:#x} rsp={:#x} cpu={}",
        vector,
        frame.error_code,
        frame.rip,
        frame.rsp,
        percpu::current_cpu_id()
    );
    if vector == 0xE {
        let cr2: u64;
        unsafe {
            asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        printkln!("page fault address {:#x}", cr2);
    }

    if frame.cs & 3 == 3 {
        // Faulting user task is terminated; the kernel carries on
        unsafe {
            percpu::with_scheduler(|sched| sched.exit_current(FAULT_EXIT_STATUS, frame));
        }
    } else {
        panic!("fatal exception {:#x} in kernel context", vector);
    }
}

/// Bring up the executing CPU's scheduler
///
/// Shared by the BSP and application processors: stamps the CPU id,
/// enables the local APIC, calibrates the timer (first caller only) and
/// installs a scheduler with its idle task.
///
/// # Safety
/// Must run once per CPU with interrupts disabled, after memory
/// management is up and with this CPU's descriptor tables loaded by the
/// boot collaborator.
pub unsafe fn init_cpu(cpu: u32, registry: Arc<KernelRegistry>) -> &'static mut KernelScheduler {
    unsafe { percpu::set_current_cpu_id(cpu) };
    let lapic = unsafe { Lapic::init() };
    lapic.calibrate();

    let idle_stack = Box::leak(vec![0u8; SYSCALL_STACK_SIZE].into_boxed_slice());
    let idle_stack_top = idle_stack.as_ptr() as u64 + SYSCALL_STACK_SIZE as u64;

    let platform = X64Platform { lapic, cpu };
    let scheduler = Scheduler::new(
        platform,
        registry,
        idle_loop as usize as u64,
        idle_stack_top,
    )
    .expect("scheduler construction only fails without memory");
    let scheduler: &'static mut KernelScheduler = Box::leak(Box::new(scheduler));
    let pointer: *mut KernelScheduler = &mut *scheduler;
    unsafe { percpu::install_scheduler(cpu, pointer) };
    scheduler
}

/// Enable interrupts and idle; the timer takes over from here
pub fn enter_idle() -> ! {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
    idle_loop()
}

/// Entry point application processors jump to from the boot handoff
///
/// The boot collaborator loads the shared GDT/IDT and this CPU's TSS
/// before jumping here with a pointer to the CPU's handoff record in
/// the first argument register.
pub extern "C" fn application_cpu_entry(info: *mut crate::SmpCpuInfo) -> ! {
    let cpu = unsafe { (*info).extra_argument } as u32;
    let registry = GLOBAL_REGISTRY
        .get()
        .expect("BSP publishes the registry before starting cores")
        .clone();
    unsafe { init_cpu(cpu, registry) };
    printkln!("cpu {} online", cpu);
    enter_idle()
}

/// Registry shared with application processors during bring-up
static GLOBAL_REGISTRY: spin::Once<Arc<KernelRegistry>> = spin::Once::new();

/// Kick off the application processors
///
/// Writes each sleeping CPU's handoff record: its logical id, a fresh
/// kernel stack, and the address to jump to.
///
/// # Safety
/// `cpus` must be the live SMP handoff table and each entry's CPU must
/// be parked on it as the boot protocol specifies.
pub unsafe fn start_cores(cpus: &mut [crate::SmpCpuInfo], bsp_lapic_id: u32) {
    for (index, cpu) in cpus.iter_mut().enumerate() {
        if cpu.lapic_id == bsp_lapic_id {
            continue;
        }
        let stack = Box::leak(vec![0u8; SYSCALL_STACK_SIZE].into_boxed_slice());
        cpu.extra_argument = index as u64;
        cpu.target_stack = stack.as_ptr() as u64 + SYSCALL_STACK_SIZE as u64;
        // The write of goto_address releases the parked CPU
        let goto = &mut cpu.goto_address as *mut u64;
        unsafe {
            core::ptr::write_volatile(goto, application_cpu_entry as usize as u64);
        }
    }
}

/// Publish the registry for application processors
pub fn publish_registry(registry: Arc<KernelRegistry>) {
    GLOBAL_REGISTRY.call_once(|| registry);
}
