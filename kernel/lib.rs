//! quark - a small x86_64 multitasking kernel core
//!
//! Preemptive per-CPU round-robin scheduling with timer-driven switching,
//! a software-interrupt syscall layer that can suspend tasks mid-call, a
//! vnode VFS with ext2 and device filesystems behind it, and an ELF
//! loader with dynamic-linker chaining.
//!
//! The crate is the kernel's core: the boot shim hands over a
//! [`BootInfo`] and jumps to [`kernel_main`]; ISR stubs deliver every
//! interrupt frame to `arch::x86_64::isr_handler`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod elf;
pub mod error;
pub mod fs;
pub mod mm;
pub mod printk;
pub mod storage;
pub mod syscall;
pub mod task;
pub mod tty;
pub mod uaccess;
pub mod waitqueue;

use alloc::sync::Arc;

use fs::FileSystem;

use mm::frame::MemoryRegion;

/// One entry of the SMP handoff table
///
/// Application processors park on their entry; writing `goto_address`
/// releases them with `target_stack` loaded and a pointer to the entry
/// in the first argument register.
#[derive(Debug)]
#[repr(C)]
pub struct SmpCpuInfo {
    pub processor_id: u32,
    pub lapic_id: u32,
    pub target_stack: u64,
    pub goto_address: u64,
    pub extra_argument: u64,
}

/// Everything the boot shim hands to [`kernel_main`]
#[derive(Debug)]
#[repr(C)]
pub struct BootInfo {
    /// SMP table, one entry per CPU
    pub cpus: *mut SmpCpuInfo,
    pub cpu_count: u64,
    pub bsp_lapic_id: u32,
    _reserved: u32,
    /// Usable physical memory spans
    pub memory_map: *const MemoryRegion,
    pub memory_map_len: u64,
    /// Kernel heap span (higher-half virtual)
    pub heap_base: u64,
    pub heap_length: u64,
    /// Physical span of the ext2 boot image
    pub ramdisk_base: u64,
    pub ramdisk_length: u64,
}

#[cfg(all(not(test), target_arch = "x86_64"))]
#[global_allocator]
static HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    printkln!("kernel panic: {}", info);
    printk::flush();
    loop {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("cli; hlt", options(nomem, nostack));
        }
    }
}

/// First program loaded once the VFS is up
const INIT_PATH: &str = "/bin/init";

/// Kernel entry, called by the boot shim on the BSP with interrupts
/// disabled and the tables of this CPU loaded
///
/// # Safety
/// `boot` must describe a live, correctly mapped machine as specified
/// on [`BootInfo`]. Never returns; ends in the idle loop with
/// interrupts enabled.
#[cfg(target_arch = "x86_64")]
pub unsafe fn kernel_main(boot: &'static mut BootInfo) -> ! {
    use crate::fs::devfs::DevFs;
    use crate::fs::ext2::Ext2Fs;
    use crate::storage::RamDisk;

    #[cfg(not(test))]
    unsafe {
        HEAP.lock().init(boot.heap_base as *mut u8, boot.heap_length as usize);
    }

    printk::register_console(unsafe { arch::x86_64::serial::init() });
    printkln!("quark: core starting on cpu 0");

    // Physical frames from the boot memory map
    let regions =
        unsafe { core::slice::from_raw_parts(boot.memory_map, boot.memory_map_len as usize) };
    let frames: &'static mm::frame::FrameAllocator =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(mm::frame::FrameAllocator::new(regions)));
    mm::set_frame_source(frames);
    printkln!("quark: {} frames available", frames.free_frames());

    // Root filesystem from the boot ramdisk
    let disk = Arc::new(unsafe { RamDisk::new(boot.ramdisk_base, boot.ramdisk_length) });
    let ext2 = Ext2Fs::mount(disk).expect("boot image is a valid ext2 filesystem");
    let root = ext2.root_vnode().expect("ext2 root directory readable");
    fs::set_root_filesystem(root);

    // Device filesystem with the terminal, mounted at /dev
    let devfs = DevFs::new();
    devfs.register(tty::init());
    let dev_dir = fs::resolve_path("/dev")
        .and_then(fs::Resolved::existing)
        .expect("boot image provides /dev");
    fs::mount(dev_dir, devfs.root());
    printkln!("quark: vfs ready");

    // Scheduling: registry, this CPU's scheduler, the first program
    let registry = task::sched::SchedRegistry::new();
    arch::x86_64::publish_registry(registry.clone());
    let scheduler = unsafe { arch::x86_64::init_cpu(0, registry) };

    let init_pid = fs::with_mount_table(|mounts| scheduler.spawn_elf(mounts, INIT_PATH, true))
        .expect("init program loads");
    printkln!("quark: spawned {} as pid {}", INIT_PATH, init_pid);

    // Release the other CPUs, then let the timer drive everything
    let cpus =
        unsafe { core::slice::from_raw_parts_mut(boot.cpus, boot.cpu_count as usize) };
    unsafe { arch::x86_64::start_cores(cpus, boot.bsp_lapic_id) };

    arch::x86_64::enter_idle()
}
