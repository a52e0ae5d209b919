//! Per-CPU round-robin scheduler
//!
//! One scheduler instance runs on each CPU, driving that CPU's run queue
//! and one-shot timer. Selection is strict round-robin: the first
//! `Normal` task from the queue front runs next, non-runnable tasks are
//! skipped in place, and the previously running task goes to the tail.
//! The timer is always armed within the preemption cap so the scheduler
//! is entered at least every 100 ms.
//!
//! Cross-CPU wakeups (`unblock`/`unsuspend`) go through the
//! [`SchedRegistry`], which finds the task by PID under the owning
//! queue's lock. A task currently executing on a CPU is not in any
//! queue, so every suspension parks the task in its queue first (the
//! voluntary reschedule interrupt) before a wakeup can name it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::{Platform, TrapFrame};
use crate::error::{KernelError, KernelResult};
use crate::mm::AddressSpace;
use crate::printkln;

use super::{Pid, Task, TaskState};

/// Preemption cap: the timer never sleeps longer than this
pub const MAX_TIMER_MS: u64 = 100;

/// Pending sleep or timeout
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub remaining_ms: u64,
    pub unblock_on_expire: bool,
    pub pid: Pid,
}

/// One CPU's run queue; blocked tasks stay queued and are skipped
pub type RunQueue<A> = Mutex<VecDeque<Task<A>>>;

/// Record of an exited task awaiting its parent
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub pid: Pid,
    pub parent: Pid,
    pub status: i32,
}

/// Pack a reaped child into a wait return value
pub fn encode_wait(pid: Pid, status: i32) -> u64 {
    (pid << 32) | status as u32 as u64
}

/// Split a wait return value back into (pid, status)
pub fn decode_wait(value: u64) -> (Pid, i32) {
    (value >> 32, value as u32 as i32)
}

/// Directory of every CPU's run queue plus process-wide exit records
///
/// Wakeups walk the queues under each queue's lock; references to tasks
/// never leave the lock, only PIDs travel between CPUs.
pub struct SchedRegistry<A: AddressSpace> {
    queues: Mutex<Vec<Arc<RunQueue<A>>>>,
    zombies: Mutex<Vec<ExitRecord>>,
}

impl<A: AddressSpace> SchedRegistry<A> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(Vec::new()),
            zombies: Mutex::new(Vec::new()),
        })
    }

    /// Create and register the run queue for a new CPU
    fn attach_queue(&self) -> Arc<RunQueue<A>> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        self.queues.lock().push(queue.clone());
        queue
    }

    /// Run `f` on the queued task with this PID, if it exists
    fn with_task<R>(&self, pid: Pid, f: impl FnOnce(&mut Task<A>) -> R) -> Option<R> {
        let queues: Vec<_> = self.queues.lock().clone();
        for queue in queues {
            let mut queue = queue.lock();
            if let Some(task) = queue.iter_mut().find(|t| t.pid == pid) {
                return Some(f(task));
            }
        }
        None
    }

    /// Transition a `Blocked` task back to `Normal`
    ///
    /// Does not deliver a value: the task keeps whatever its return
    /// register held when it suspended.
    pub fn unblock(&self, pid: Pid) -> bool {
        self.with_task(pid, |task| {
            if task.state == TaskState::Blocked {
                task.state = TaskState::Normal;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Wake a suspended task and place `value` in its return register
    pub fn unsuspend(&self, pid: Pid, value: u64) -> bool {
        self.with_task(pid, |task| {
            if matches!(task.state, TaskState::Blocked | TaskState::WaitingForChild) {
                task.frame.rax = value;
                task.state = TaskState::Normal;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Wake `parent` iff it is waiting for a child; delivers the reaped
    /// child's PID and status
    fn wake_waiting_parent(&self, parent: Pid, child: Pid, status: i32) -> bool {
        self.with_task(parent, |task| {
            if task.state == TaskState::WaitingForChild {
                task.frame.rax = encode_wait(child, status);
                task.state = TaskState::Normal;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Reap one zombie child of `parent`, if any
    pub fn take_zombie_of(&self, parent: Pid) -> Option<ExitRecord> {
        let mut zombies = self.zombies.lock();
        let index = zombies.iter().position(|z| z.parent == parent)?;
        Some(zombies.remove(index))
    }

    fn push_zombie(&self, record: ExitRecord) {
        self.zombies.lock().push(record);
    }
}

/// Per-CPU scheduler
///
/// Owns the CPU's platform surface (timer, TSS slot), its run queue, the
/// idle task, and the currently running task. Only ever called from
/// interrupt context with interrupts disabled, which serializes all
/// per-CPU state.
pub struct Scheduler<P: Platform, A: AddressSpace> {
    platform: P,
    registry: Arc<SchedRegistry<A>>,
    queue: Arc<RunQueue<A>>,
    /// The task whose frame is live on this CPU
    current: Option<Task<A>>,
    /// Idle task when it is not the one running
    idle: Option<Task<A>>,
    /// Save the outgoing frame on the next switch?
    restore_frame: bool,
    timer_entries: Vec<TimerEntry>,
    /// Milliseconds the one-shot was last armed with
    armed_ms: u64,
}

impl<P: Platform, A: AddressSpace> Scheduler<P, A> {
    /// Build this CPU's scheduler with its idle task
    ///
    /// The idle task gets its own empty address space and runs `idle_entry`
    /// in ring 0; it is selected only when nothing else is `Normal`.
    pub fn new(
        platform: P,
        registry: Arc<SchedRegistry<A>>,
        idle_entry: u64,
        idle_stack_top: u64,
    ) -> KernelResult<Self> {
        let idle_space = A::new()?;
        let idle = Task::new(idle_space, idle_entry, idle_stack_top, false, false)?;
        let queue = registry.attach_queue();
        Ok(Self {
            platform,
            registry,
            queue,
            current: Some(idle),
            idle: None,
            restore_frame: true,
            timer_entries: Vec::new(),
            armed_ms: 0,
        })
    }

    pub fn registry(&self) -> Arc<SchedRegistry<A>> {
        self.registry.clone()
    }

    pub fn current_pid(&self) -> Pid {
        self.current.as_ref().map(|t| t.pid).unwrap_or(0)
    }

    /// Run `f` against the currently executing task
    ///
    /// Syscall handlers use this for descriptor-table and address-space
    /// access; the task is exclusively owned by this CPU while current.
    pub fn with_current<R>(&mut self, f: impl FnOnce(&mut Task<A>) -> R) -> R {
        f(self.current.as_mut().expect("a task is always current"))
    }

    /// Append a task to this CPU's run queue
    pub fn enqueue(&mut self, task: Task<A>) {
        debug_assert_ne!(task.pid, 0);
        self.queue.lock().push_back(task);
    }

    /// Arm the one-shot to the closest pending expiry, capped for
    /// guaranteed preemption
    fn arm_timer(&mut self) {
        let mut closest = MAX_TIMER_MS;
        for entry in &self.timer_entries {
            closest = closest.min(entry.remaining_ms);
        }
        self.armed_ms = closest;
        self.platform.timer_arm_one_shot(closest);
    }

    /// Account elapsed time against pending entries; expire and wake
    fn update_timer_entries(&mut self) {
        let remaining = self.platform.timer_remaining_ms();
        let elapsed = self.armed_ms.saturating_sub(remaining);

        let mut index = self.timer_entries.len();
        while index > 0 {
            index -= 1;
            if self.timer_entries[index].remaining_ms <= elapsed {
                let entry = self.timer_entries.swap_remove(index);
                if entry.unblock_on_expire {
                    debug_assert_ne!(entry.pid, 0);
                    self.registry.unblock(entry.pid);
                }
            } else {
                self.timer_entries[index].remaining_ms -= elapsed;
            }
        }
    }

    /// Switch to the next runnable task
    ///
    /// Saves the outgoing frame (unless it was dropped by exit or the
    /// idle hand-off), pushes the outgoing task to the queue tail, pops
    /// the first `Normal` task, retargets the TSS syscall stack, and
    /// overwrites `frame` with the incoming task's saved state. The
    /// caller's `iretq` then resumes the chosen task.
    pub fn switch_to_next(&mut self, frame: &mut TrapFrame) {
        self.update_timer_entries();

        let outgoing = self.current.take().expect("a task is always current");
        {
            let queue = self.queue.clone();
            let mut queue = queue.lock();
            if self.restore_frame {
                let mut outgoing = outgoing;
                outgoing.frame = *frame;
                if outgoing.pid == 0 {
                    self.idle = Some(outgoing);
                } else {
                    queue.push_back(outgoing);
                }
            } else {
                self.restore_frame = true;
                if outgoing.pid == 0 {
                    self.idle = Some(outgoing);
                }
                // A non-idle task here has exited; dropping it releases
                // its address space, stacks and descriptors
            }

            let selected = queue
                .iter()
                .position(|t| t.state == TaskState::Normal)
                .and_then(|i| queue.remove(i));
            self.current = match selected {
                Some(task) => Some(task),
                None => {
                    // Nothing runnable: the idle task takes over and its
                    // frame is never saved
                    self.restore_frame = false;
                    Some(self.idle.take().expect("idle task is parked"))
                }
            };
        }

        self.arm_timer();

        let current = self.current.as_ref().expect("a task is always current");
        self.platform.set_syscall_stack(current.kstack.top());
        self.platform.set_tls_base(current.tls_base);
        *frame = current.frame;
        current.space.activate();
    }

    /// Voluntarily give up the CPU from inside a syscall handler
    ///
    /// Marks the current task `new_state` and raises the reschedule
    /// interrupt, which parks the task (frame and kernel stack intact)
    /// in the run queue. When a wakeup makes it `Normal` again and it is
    /// rescheduled, execution resumes here and the value `unsuspend`
    /// placed in the return register is handed back.
    pub fn suspend_syscall(&mut self, new_state: TaskState) -> u64 {
        {
            let current = self.current.as_mut().expect("a task is always current");
            debug_assert_eq!(current.state, TaskState::Normal);
            debug_assert_ne!(current.pid, 0);
            current.state = new_state;
        }
        let value = self.platform.raise_reschedule();
        debug_assert_eq!(
            self.current.as_ref().map(|t| t.state),
            Some(TaskState::Normal)
        );
        value
    }

    /// Block the current task until `ms` milliseconds pass
    pub fn sleep_current(&mut self, ms: u64) -> KernelResult<()> {
        let pid = self.current_pid();
        if ms == 0 || pid == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.timer_entries.push(TimerEntry {
            remaining_ms: ms,
            unblock_on_expire: true,
            pid,
        });
        self.suspend_syscall(TaskState::Blocked);
        Ok(())
    }

    /// Terminate the current task and switch away
    ///
    /// The dying task's frame is not saved. A parent already waiting is
    /// woken with the (pid, status) pair; otherwise an exit record is
    /// kept for a later `wait_for_child`.
    pub fn exit_current(&mut self, status: i32, frame: &mut TrapFrame) {
        let (pid, parent) = {
            let current = self.current.as_ref().expect("a task is always current");
            (current.pid, current.parent)
        };
        printkln!("task {} exited with status {}", pid, status);

        if !self.registry.wake_waiting_parent(parent, pid, status) {
            self.registry.push_zombie(ExitRecord {
                pid,
                parent,
                status,
            });
        }

        self.restore_frame = false;
        self.switch_to_next(frame);
    }

    /// Duplicate the current task; returns the child PID to the parent
    ///
    /// The child gets a deep copy of the userspace mappings, a copy of
    /// the descriptor table and allocator, and a byte copy of the
    /// parent's syscall stack: both tasks resume from the same frame,
    /// the child with 0 in its return register.
    pub fn fork_current(&mut self, frame: &TrapFrame) -> KernelResult<Pid> {
        let parent = self.current.as_ref().expect("a task is always current");
        let space = parent.space.duplicate()?;
        let mut child = Task::new(space, 0, 0, true, true)?;
        child.parent = parent.pid;
        child.fds = parent.fds.duplicate();
        child.uvm = parent.uvm.clone();
        child.tls_base = parent.tls_base;
        child.kstack.copy_from(&parent.kstack);
        child.frame = *frame;
        child.frame.rax = 0;

        let pid = child.pid;
        self.queue.lock().push_back(child);
        Ok(pid)
    }

    /// Reap a child: immediately if one already exited, else suspend
    /// until one does
    pub fn wait_for_child(&mut self) -> (Pid, i32) {
        let pid = self.current_pid();
        if let Some(record) = self.registry.take_zombie_of(pid) {
            return (record.pid, record.status);
        }
        let value = self.suspend_syscall(TaskState::WaitingForChild);
        decode_wait(value)
    }

    /// Load an ELF executable as a fresh task on this CPU's queue
    pub fn spawn_elf(
        &mut self,
        mounts: &crate::fs::MountTable,
        path: &str,
        user: bool,
    ) -> KernelResult<Pid> {
        let task = super::exec::spawn_from_elf(mounts, path, user)?;
        let pid = task.pid;
        self.enqueue(task);
        Ok(pid)
    }

    /// Acknowledge the timer interrupt after a preemption switch
    pub fn timer_interrupt_done(&mut self) {
        self.platform.timer_acknowledge();
    }

    /// Record the TLS base for the current task and program it
    pub fn set_current_tls(&mut self, addr: u64) {
        self.with_current(|task| task.tls_base = addr);
        self.platform.set_tls_base(addr);
    }

    #[cfg(test)]
    fn queued_pids(&self) -> Vec<Pid> {
        self.queue.lock().iter().map(|t| t.pid).collect()
    }
}
