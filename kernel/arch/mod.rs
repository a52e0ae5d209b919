//! Architecture abstraction layer
//!
//! The scheduler and syscall paths are written against a small set of
//! traits so the core stays testable and free of register-level detail:
//!
//! - [`Platform`] - per-CPU hardware the scheduler drives (one-shot timer,
//!   TSS syscall-stack slot, TLS base, the voluntary reschedule interrupt)
//! - [`crate::mm::AddressSpace`] - paging manager surface
//!
//! The x86_64 implementation lives in [`x86_64`]. The [`TrapFrame`] layout
//! is fixed: it is produced by the ISR stubs in machine code and must not
//! be reordered.

use bitflags::bitflags;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Kernel code segment selector (GDT entry 1)
pub const KERNEL_CODE_SEGMENT: u64 = 0x08;
/// Kernel data segment selector (GDT entry 2)
pub const KERNEL_DATA_SEGMENT: u64 = 0x10;
/// User code segment selector (GDT entry 3, RPL 3)
pub const USER_CODE_SEGMENT: u64 = 0x18 | 3;
/// User data segment selector (GDT entry 4, RPL 3)
pub const USER_DATA_SEGMENT: u64 = 0x20 | 3;

/// RFLAGS for a fresh task: interrupts enabled, reserved bit 1 set
pub const INITIAL_RFLAGS: u64 = 0x202;

/// IDT vector the LAPIC one-shot timer is wired to
pub const TIMER_VECTOR: u64 = 48;
/// IDT vector of the PS/2 keyboard IRQ
pub const KEYBOARD_VECTOR: u64 = 32 + 1;
/// Software interrupt used for system calls
pub const SYSCALL_VECTOR: u64 = 0x80;
/// Software interrupt raised by `suspend_syscall` to force a switch
pub const RESCHEDULE_VECTOR: u64 = 0x81;

bitflags! {
    /// Page mapping flags understood by the paging manager
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
        const NO_EXECUTE = 1 << 2;
    }
}

/// Saved register state pushed on interrupt entry
///
/// The ISR stub pushes the segment selectors and general registers on top
/// of the CPU-pushed interrupt record; the dispatcher receives a pointer
/// to this struct on the current kernel stack. Restoring a task is
/// overwriting this struct before `iretq` unwinds it.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub interrupt_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Build the initial frame for a fresh task
    pub fn initial(entry: u64, stack_ptr: u64, user: bool) -> Self {
        let (cs, data) = if user {
            (USER_CODE_SEGMENT, USER_DATA_SEGMENT)
        } else {
            (KERNEL_CODE_SEGMENT, KERNEL_DATA_SEGMENT)
        };
        Self {
            es: data,
            ds: data,
            rip: entry,
            cs,
            rflags: INITIAL_RFLAGS,
            rsp: stack_ptr,
            ss: data,
            ..Self::default()
        }
    }
}

/// Per-CPU hardware surface the scheduler drives
///
/// One implementor instance exists per CPU and is owned by that CPU's
/// scheduler. All methods are called with interrupts disabled.
pub trait Platform {
    /// Arm the one-shot preemption timer to fire in `ms` milliseconds
    fn timer_arm_one_shot(&mut self, ms: u64);

    /// Milliseconds left until the armed timer fires (0 if it already has)
    fn timer_remaining_ms(&mut self) -> u64;

    /// Signal end-of-interrupt for the timer vector
    fn timer_acknowledge(&mut self);

    /// Point the TSS syscall stack at `top` so ring-0 entry lands on the
    /// current task's kernel stack
    fn set_syscall_stack(&mut self, top: u64);

    /// Program the FS base used for thread-local storage
    fn set_tls_base(&mut self, addr: u64);

    /// Raise the voluntary reschedule interrupt and return the value found
    /// in the return register once this task is resumed
    fn raise_reschedule(&mut self) -> u64;

    /// Logical id of the CPU this instance belongs to
    fn cpu_id(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_frame_layout_is_abi_stable() {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 23 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rax), 16 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, interrupt_number), 17 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 19 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 22 * 8);
    }

    #[test]
    fn test_initial_frame_selectors() {
        let user = TrapFrame::initial(0x1000, 0x2000, true);
        assert_eq!(user.cs, USER_CODE_SEGMENT);
        assert_eq!(user.ss, USER_DATA_SEGMENT);
        assert_eq!(user.rflags, INITIAL_RFLAGS);
        let kernel = TrapFrame::initial(0x1000, 0x2000, false);
        assert_eq!(kernel.cs, KERNEL_CODE_SEGMENT);
        assert_eq!(kernel.ds, KERNEL_DATA_SEGMENT);
    }
}
