//! System call dispatch
//!
//! Software interrupt 0x80 lands here with the call number in rax and up
//! to six arguments in rdi/rsi/rdx/rcx/r8/r9. The result goes back into
//! the frame's rax; failures are encoded as the negated error
//! discriminant, and this is the only place that conversion happens.
//!
//! Handlers that cannot make progress (an empty blocking device) park
//! the task on the device's wait queue and suspend; they retry when the
//! device wakes them.

use alloc::sync::Arc;

use crate::arch::{Platform, TrapFrame};
use crate::error::{KernelError, KernelResult};
use crate::fs::devfs::{self, CharDevice};
use crate::fs::vnode::Vnode;
use crate::fs::{MountTable, OpenFlags, Resolved, SeekWhence, VnodeKind};
use crate::mm::{AddressSpace, PAGE_SIZE};
use crate::printkln;
use crate::task::sched::Scheduler;
use crate::task::TaskState;
use crate::uaccess::{check_user_range, copy_to_user, str_from_user, PATH_MAX};
use crate::arch::PageFlags;

/// System call numbers (ABI-stable)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Open = 0,
    Read = 1,
    Write = 2,
    Seek = 3,
    Close = 4,
    FileMap = 5,
    TcbSet = 6,
    Exit = 8,
    Sleep = 9,
    Stat = 10,
    FStat = 11,
    SetTerminalSettings = 12,
    Panic = 254,
    Log = 255,
}

impl SyscallNumber {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Open,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Seek,
            4 => Self::Close,
            5 => Self::FileMap,
            6 => Self::TcbSet,
            8 => Self::Exit,
            9 => Self::Sleep,
            10 => Self::Stat,
            11 => Self::FStat,
            12 => Self::SetTerminalSettings,
            254 => Self::Panic,
            255 => Self::Log,
            _ => return None,
        })
    }
}

/// File metadata returned by Stat/FStat
///
/// Thirty-two bytes; `kind` uses the same values as [`VnodeKind`]'s
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Stat {
    pub inode: u64,
    pub kind: u32,
    pub reserved: u32,
    pub size: u64,
    pub filesystem: u64,
}

fn kind_code(kind: VnodeKind) -> u32 {
    match kind {
        VnodeKind::RegularFile => 0,
        VnodeKind::Directory => 1,
        VnodeKind::CharacterDevice => 2,
        VnodeKind::Symlink => 3,
    }
}

fn stat_of(vnode: &Vnode) -> Stat {
    Stat {
        inode: vnode.inode,
        kind: kind_code(vnode.kind),
        reserved: 0,
        size: vnode.size(),
        filesystem: vnode.fs_id,
    }
}

fn write_stat(out: u64, stat: &Stat) -> KernelResult<u64> {
    let bytes = unsafe {
        core::slice::from_raw_parts(
            stat as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        )
    };
    copy_to_user(out, bytes)?;
    Ok(0)
}

/// Entry point for interrupt 0x80
///
/// Decodes the frame, runs the handler, and writes the result register.
/// `Exit` and `Panic` never return a value.
pub fn dispatch<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    mounts: &MountTable,
    frame: &mut TrapFrame,
) {
    let (arg0, arg1, arg2, arg3) = (frame.rdi, frame.rsi, frame.rdx, frame.rcx);

    let number = match SyscallNumber::from_raw(frame.rax) {
        Some(number) => number,
        None => {
            frame.rax = KernelError::InvalidArgument.sysret();
            return;
        }
    };

    match number {
        SyscallNumber::Exit => {
            sched.exit_current(arg0 as i32, frame);
            // The frame now belongs to the next task
            return;
        }
        SyscallNumber::Panic => {
            let message = str_from_user(arg0, PATH_MAX).unwrap_or_default();
            panic!("userspace panic: {}", message);
        }
        _ => {}
    }

    let result = match number {
        SyscallNumber::Open => sys_open(sched, mounts, arg0, arg1),
        SyscallNumber::Read => sys_read(sched, arg0, arg1, arg2),
        SyscallNumber::Write => sys_write(sched, arg0, arg1, arg2),
        SyscallNumber::Seek => sys_seek(sched, arg0, arg1, arg2),
        SyscallNumber::Close => sched.with_current(|t| t.fds.close(arg0)).map(|_| 0),
        SyscallNumber::FileMap => sys_file_map(sched, arg1, arg2, arg3),
        SyscallNumber::TcbSet => {
            sched.set_current_tls(arg0);
            Ok(0)
        }
        SyscallNumber::Sleep => sched.sleep_current(arg0).map(|_| 0),
        SyscallNumber::Stat => sys_stat(mounts, arg0, arg1),
        SyscallNumber::FStat => {
            sched.with_current(|t| t.fds.vnode(arg0)).and_then(|vnode| {
                write_stat(arg1, &stat_of(&vnode))
            })
        }
        SyscallNumber::SetTerminalSettings => sys_set_terminal(sched, arg0, arg1),
        SyscallNumber::Log => sys_log(arg0),
        SyscallNumber::Exit | SyscallNumber::Panic => unreachable!(),
    };

    frame.rax = match result {
        Ok(value) => value,
        Err(err) => err.sysret(),
    };
}

fn sys_open<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    mounts: &MountTable,
    path_ptr: u64,
    flags: u64,
) -> KernelResult<u64> {
    let path = str_from_user(path_ptr, PATH_MAX)?;
    let flags = OpenFlags::from_bits(flags).ok_or(KernelError::InvalidArgument)?;
    sched.with_current(|t| t.fds.open(mounts, &path, flags))
}

/// The device behind a descriptor, when it names one
fn device_of_fd<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    fd: u64,
) -> KernelResult<Option<Arc<dyn CharDevice>>> {
    let vnode = sched.with_current(|t| t.fds.vnode(fd))?;
    Ok(devfs::device_of(&vnode))
}

fn sys_read<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    fd: u64,
    buf: u64,
    count: u64,
) -> KernelResult<u64> {
    check_user_range(buf, count as usize)?;
    loop {
        let attempt = sched.with_current(|t| {
            let slice =
                unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, count as usize) };
            t.fds.read(fd, slice)
        });
        match attempt {
            Ok(count) => return Ok(count as u64),
            Err(KernelError::WouldBlock) => {
                if sched
                    .with_current(|t| t.fds.flags(fd))?
                    .contains(OpenFlags::NON_BLOCK)
                {
                    return Err(KernelError::WouldBlock);
                }
                let device = device_of_fd(sched, fd)?.ok_or(KernelError::WouldBlock)?;
                match device.read_queue() {
                    Some(queue) => queue.register(sched.current_pid()),
                    None => return Err(KernelError::WouldBlock),
                }
                sched.suspend_syscall(TaskState::Blocked);
            }
            Err(err) => return Err(err),
        }
    }
}

fn sys_write<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    fd: u64,
    buf: u64,
    count: u64,
) -> KernelResult<u64> {
    check_user_range(buf, count as usize)?;
    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, count as usize) };
    sched
        .with_current(|t| t.fds.write(fd, slice))
        .map(|count| count as u64)
}

fn sys_seek<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    fd: u64,
    offset: u64,
    whence: u64,
) -> KernelResult<u64> {
    let whence = SeekWhence::from_raw(whence)?;
    sched.with_current(|t| t.fds.seek(fd, offset as i64, whence))
}

/// Map `length` bytes of fresh user memory, filled from a file when `fd`
/// is non-negative
fn sys_file_map<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    length: u64,
    fd: u64,
    offset: u64,
) -> KernelResult<u64> {
    if length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let vnode = if (fd as i64) < 0 {
        None
    } else {
        Some(sched.with_current(|t| t.fds.vnode(fd))?)
    };

    sched.with_current(|t| {
        let base = t.uvm.allocate(length);
        let pages = length.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let va = base + page * PAGE_SIZE;
            let window = t
                .space
                .map_user_page(va, PageFlags::WRITE | PageFlags::USER)?;
            let window =
                unsafe { core::slice::from_raw_parts_mut(window, PAGE_SIZE as usize) };
            window.fill(0);
            if let Some(vnode) = &vnode {
                // Short reads leave the rest of the page zeroed
                vnode
                    .fs
                    .read(vnode, window, offset + page * PAGE_SIZE)?;
            }
        }
        Ok(base)
    })
}

fn sys_stat(mounts: &MountTable, path_ptr: u64, out: u64) -> KernelResult<u64> {
    let path = str_from_user(path_ptr, PATH_MAX)?;
    match crate::fs::path::resolve(mounts, &path)? {
        Resolved::Found(vnode) => write_stat(out, &stat_of(&vnode)),
        Resolved::Missing { .. } => Err(KernelError::NotFound),
    }
}

fn sys_set_terminal<P: Platform, A: AddressSpace>(
    sched: &mut Scheduler<P, A>,
    fd: u64,
    settings_ptr: u64,
) -> KernelResult<u64> {
    let device = device_of_fd(sched, fd)?.ok_or(KernelError::NotSupported)?;
    let mut raw = [0u8; 16];
    crate::uaccess::copy_from_user(&mut raw, settings_ptr)?;
    device.set_terminal_settings(raw)?;
    Ok(0)
}

fn sys_log(message_ptr: u64) -> KernelResult<u64> {
    let message = str_from_user(message_ptr, PATH_MAX)?;
    printkln!("{}", message);
    Ok(0)
}
