//! Memory management interfaces
//!
//! The core needs three things from the memory subsystem: 4 KiB physical
//! frames, a per-task paging manager, and a per-task allocator of unused
//! userspace virtual ranges. The first two are behind traits so hosted
//! tests can substitute in-memory fakes.

pub mod frame;
#[cfg(target_arch = "x86_64")]
pub mod paging;
pub mod uvm;

use spin::Once;

use crate::arch::PageFlags;
use crate::error::{KernelError, KernelResult};

/// Size of a physical frame and of every mapping granule
pub const PAGE_SIZE: u64 = 0x1000;

/// Base of the higher-half alias of all physical memory
pub const HIGHER_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// First address past the canonical lower half; user pointers must be below
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Translate a physical address to its higher-half kernel alias
#[inline]
pub const fn phys_to_virt(pa: u64) -> u64 {
    HIGHER_HALF_BASE + pa
}

/// Round `addr` down to its page base
#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Number of pages covering `len` bytes
#[inline]
pub const fn pages_for(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE)
}

/// Provider of 4 KiB physical frames
///
/// Implementations lock internally; the trait is callable from any context
/// with interrupts disabled.
pub trait FrameSource: Sync {
    /// Allocate one frame, returning its physical address
    fn alloc(&self) -> Option<u64>;

    /// Return a frame to the pool
    fn free(&self, pa: u64);
}

static FRAME_SOURCE: Once<&'static dyn FrameSource> = Once::new();

/// Install the boot-constructed frame allocator
pub fn set_frame_source(source: &'static dyn FrameSource) {
    FRAME_SOURCE.call_once(|| source);
}

/// Allocate a physical frame from the installed source
pub fn alloc_frame() -> KernelResult<u64> {
    FRAME_SOURCE
        .get()
        .and_then(|s| s.alloc())
        .ok_or(KernelError::OutOfMemory)
}

/// Free a physical frame back to the installed source
pub fn free_frame(pa: u64) {
    if let Some(source) = FRAME_SOURCE.get() {
        source.free(pa);
    }
}

/// Per-task paging manager surface
///
/// An address space owns its user mappings and the frames behind them.
/// Kernel mappings (higher half) are shared by construction and are not
/// visible through this trait.
pub trait AddressSpace: Sized + Send {
    /// Create an empty user address space with kernel mappings in place
    fn new() -> KernelResult<Self>;

    /// Allocate a frame and map it at the page containing `va`
    ///
    /// Returns a kernel-visible window onto the frame so callers can fill
    /// it before the task ever runs. Mapping an already-mapped page is an
    /// `InvalidArgument` error.
    fn map_user_page(&mut self, va: u64, flags: PageFlags) -> KernelResult<*mut u8>;

    /// Deep-copy every user mapping into a new space with fresh frames
    fn duplicate(&self) -> KernelResult<Self>;

    /// Make this the active address space on the calling CPU
    fn activate(&self);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_space_duplicate_is_deep() {
        use testing::MockSpace;
        let mut parent = MockSpace::new().unwrap();
        let window = parent
            .map_user_page(0x1000, PageFlags::WRITE | PageFlags::USER)
            .unwrap();
        unsafe { *window = 7 };
        let child = parent.duplicate().unwrap();
        unsafe { *window = 9 };
        assert_eq!(child.page(0x1000).unwrap()[0], 7);
        assert_eq!(parent.page(0x1000).unwrap()[0], 9);
    }

    #[test]
    fn test_mock_space_rejects_double_map() {
        use testing::MockSpace;
        let mut space = MockSpace::new().unwrap();
        space.map_user_page(0x2000, PageFlags::USER).unwrap();
        assert!(space.map_user_page(0x2fff, PageFlags::USER).is_err());
    }

    #[test]
    fn test_page_math() {
        assert_eq!(page_base(0x1fff), 0x1000);
        assert_eq!(page_base(0x2000), 0x2000);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(0x1000), 1);
        assert_eq!(pages_for(0x1001), 2);
    }

    #[test]
    fn test_phys_to_virt_is_higher_half() {
        assert_eq!(phys_to_virt(0x1000), 0xFFFF_8000_0000_1000);
    }
}
