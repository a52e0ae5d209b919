//! Task management
//!
//! A task is the unit of scheduling: saved interrupt frame, owned address
//! space, descriptor table, userspace allocator, and a dedicated kernel
//! stack used while servicing system calls. PID 0 is reserved for each
//! CPU's idle task; user PIDs come from a global monotonic counter.

pub mod exec;
pub mod sched;

use alloc::boxed::Box;
use alloc::vec;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::TrapFrame;
use crate::error::KernelResult;
use crate::fs::FdTable;
use crate::mm::uvm::UserspaceAllocator;
use crate::mm::AddressSpace;

/// Process ID type
pub type Pid = u64;

/// Pages in a per-task syscall stack
pub const SYSCALL_STACK_PAGES: usize = 3;
/// Per-task syscall stack size in bytes
pub const SYSCALL_STACK_SIZE: usize = SYSCALL_STACK_PAGES * 0x1000;

/// Scheduling state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable or running
    Normal,
    /// Suspended until `unblock`/`unsuspend`
    Blocked,
    /// Suspended in `wait_for_child`
    WaitingForChild,
    /// Exited, not yet reaped by the parent
    Zombie,
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh PID (relaxed: only uniqueness matters)
pub fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Dedicated kernel stack used while a task is in ring 0
///
/// Sixteen-byte aligned heap storage; the TSS is pointed at `top()` when
/// the task is scheduled so nested interrupts land here.
pub struct KernelStack {
    pub(crate) mem: Box<[u128]>,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            mem: vec![0u128; SYSCALL_STACK_SIZE / 16].into_boxed_slice(),
        }
    }

    /// Highest address, exclusive; the initial stack pointer
    pub fn top(&self) -> u64 {
        self.mem.as_ptr() as u64 + SYSCALL_STACK_SIZE as u64
    }

    /// Byte-copy another stack's contents into this one
    ///
    /// Fork relies on this: the child resumes inside the same syscall at
    /// the same stack offset as the parent.
    pub fn copy_from(&mut self, other: &KernelStack) {
        self.mem.copy_from_slice(&other.mem);
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self.mem.as_ptr() as *const u8, SYSCALL_STACK_SIZE)
        }
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

/// The unit of scheduling
pub struct Task<A: AddressSpace> {
    pub pid: Pid,
    pub parent: Pid,
    pub state: TaskState,
    /// Saved register state; restored on the next dispatch
    pub frame: TrapFrame,
    pub space: A,
    pub fds: FdTable,
    pub uvm: UserspaceAllocator,
    pub kstack: KernelStack,
    /// FS base programmed for thread-local storage
    pub tls_base: u64,
}

impl<A: AddressSpace> Task<A> {
    /// Create a task around an existing address space
    ///
    /// `assign_pid` is false only for per-CPU idle tasks, which share
    /// PID 0 and are never enqueued.
    pub fn new(
        space: A,
        entry: u64,
        stack_ptr: u64,
        user: bool,
        assign_pid: bool,
    ) -> KernelResult<Self> {
        Ok(Self {
            pid: if assign_pid { alloc_pid() } else { 0 },
            parent: 0,
            state: TaskState::Normal,
            frame: TrapFrame::initial(entry, stack_ptr, user),
            space,
            fds: FdTable::new(),
            uvm: UserspaceAllocator::new(),
            kstack: KernelStack::new(),
            tls_base: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::MockSpace;

    #[test]
    fn test_pids_are_unique_and_nonzero() {
        let a = alloc_pid();
        let b = alloc_pid();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_idle_task_has_pid_zero() {
        let task = Task::new(MockSpace::new().unwrap(), 0, 0, false, false).unwrap();
        assert_eq!(task.pid, 0);
        let user = Task::new(MockSpace::new().unwrap(), 0, 0, true, true).unwrap();
        assert_ne!(user.pid, 0);
    }

    #[test]
    fn test_kernel_stack_copy_is_bytewise() {
        let mut a = KernelStack::new();
        let b = KernelStack::new();
        assert_eq!(a.top() % 16, 0);
        a.mem[0] = 0xDEAD_BEEF;
        a.mem[SYSCALL_STACK_SIZE / 16 - 1] = 0xF00D;
        a.copy_from(&b);
        assert_eq!(a.bytes(), b.bytes());
    }
}
