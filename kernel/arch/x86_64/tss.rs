//! Task state segment surface
//!
//! The only field the core touches is the IST1 stack pointer, which is
//! retargeted to the incoming task's syscall stack on every switch so
//! ring-0 entry lands on memory that task owns. Building the GDT entry
//! that points at these structures is the boot collaborator's job; it
//! calls [`tss_for_cpu`] to find them.

use core::cell::UnsafeCell;

/// 64-bit TSS layout
#[repr(C, packed(4))]
pub struct Tss {
    _reserved0: u32,
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _reserved1: u64,
    /// IST1: the per-task syscall stack
    pub ist1: u64,
    pub ist2: u64,
    pub ist3: u64,
    pub ist4: u64,
    pub ist5: u64,
    pub ist6: u64,
    pub ist7: u64,
    _reserved2: u64,
    _reserved3: u16,
    pub iopb_offset: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist1: 0,
            ist2: 0,
            ist3: 0,
            ist4: 0,
            ist5: 0,
            ist6: 0,
            ist7: 0,
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: core::mem::size_of::<Tss>() as u16,
        }
    }
}

/// Maximum CPUs with a static TSS slot
pub const MAX_CPUS: usize = 16;

struct TssSlot(UnsafeCell<Tss>);

// Each slot is only ever touched by its own CPU
unsafe impl Sync for TssSlot {}

static TSS_TABLE: [TssSlot; MAX_CPUS] = {
    const SLOT: TssSlot = TssSlot(UnsafeCell::new(Tss::new()));
    [SLOT; MAX_CPUS]
};

/// This CPU's TSS
///
/// # Safety
/// The returned pointer must only be dereferenced by CPU `cpu` (or by
/// the boot path before that CPU runs).
pub fn tss_for_cpu(cpu: usize) -> *mut Tss {
    TSS_TABLE[cpu].0.get()
}

/// Point this CPU's syscall-entry stacks at `top`
///
/// # Safety
/// Caller must be running on CPU `cpu` with interrupts disabled.
pub unsafe fn set_syscall_stack(cpu: usize, top: u64) {
    let tss = tss_for_cpu(cpu);
    unsafe {
        (*tss).rsp0 = top;
        (*tss).ist1 = top;
    }
}
