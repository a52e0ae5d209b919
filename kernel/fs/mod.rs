//! Virtual filesystem layer
//!
//! Concrete filesystems (ext2, devfs) sit behind the [`FileSystem`] trait;
//! everything above it works with cached [`Vnode`](vnode::Vnode) handles.
//! The mount table stitches filesystem roots into one namespace and path
//! traversal consults it at every directory crossing.

pub mod devfs;
pub mod ext2;
pub mod file;
pub mod mount;
pub mod path;
pub mod vnode;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::error::{KernelError, KernelResult};

pub use file::{FdTable, OpenFlags, SeekWhence};
pub use mount::MountTable;
pub use path::Resolved;
pub use vnode::{Vnode, VnodeKind};

/// Identifies one mounted filesystem instance for the vnode cache
pub type FsId = u64;

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique filesystem id
pub fn alloc_fs_id() -> FsId {
    NEXT_FS_ID.fetch_add(1, Ordering::Relaxed)
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub inode: u64,
    pub kind: VnodeKind,
}

/// Filesystem backend surface
///
/// Offsets are byte offsets from the start of the object. `read` past the
/// end returns short counts (possibly 0); `write` past the end extends
/// the object. Operations a backend cannot express default to
/// `NotSupported`.
pub trait FileSystem: Send + Sync {
    /// This instance's cache id
    fn id(&self) -> FsId;

    /// Root directory vnode
    fn root(&self) -> Arc<Vnode>;

    /// Read up to `buf.len()` bytes at `offset`
    fn read(&self, vnode: &Vnode, buf: &mut [u8], offset: u64) -> KernelResult<usize>;

    /// Write `buf` at `offset`, extending the object if needed
    fn write(&self, vnode: &Vnode, buf: &[u8], offset: u64) -> KernelResult<usize>;

    /// Look up `name` in a directory; `Ok(None)` means no such entry
    fn find_in_directory(&self, dir: &Vnode, name: &str)
        -> KernelResult<Option<Arc<Vnode>>>;

    /// Enumerate a directory
    fn list_directory(&self, dir: &Vnode) -> KernelResult<Vec<DirEntryInfo>>;

    /// Create `name` in a directory
    fn create(&self, dir: &Vnode, name: &str, kind: VnodeKind) -> KernelResult<Arc<Vnode>> {
        let _ = (dir, name, kind);
        Err(KernelError::NotSupported)
    }

    /// Drop an object's contents (size becomes 0)
    fn truncate(&self, vnode: &Vnode) -> KernelResult<()> {
        let _ = vnode;
        Err(KernelError::NotSupported)
    }

    /// Remove a directory entry
    fn remove(&self, dir: &Vnode, name: &str) -> KernelResult<()> {
        let _ = (dir, name);
        Err(KernelError::NotSupported)
    }
}

/// The kernel's mount table
///
/// Built once during boot; append-only afterwards, hence the reader-writer
/// lock is effectively uncontended at steady state.
static MOUNTS: RwLock<MountTable> = RwLock::new(MountTable::new());

/// Install the root filesystem
pub fn set_root_filesystem(root: Arc<Vnode>) {
    MOUNTS.write().set_root(root);
}

/// Mount a filesystem root over an existing directory vnode
pub fn mount(mount_point: Arc<Vnode>, fs_root: Arc<Vnode>) {
    MOUNTS.write().mount(mount_point, fs_root);
}

/// Resolve an absolute path against the kernel mount table
pub fn resolve_path(path: &str) -> KernelResult<Resolved> {
    path::resolve(&MOUNTS.read(), path)
}

/// Run `f` with the kernel mount table
pub fn with_mount_table<R>(f: impl FnOnce(&MountTable) -> R) -> R {
    f(&MOUNTS.read())
}
