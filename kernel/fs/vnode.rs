//! Vnode - cached handle to a filesystem object
//!
//! A vnode is identified by `(filesystem id, inode number)`. The cache is
//! the canonical owner: repeated lookups of the same object return the
//! same `Arc`, so descriptors that land on the same file share state
//! (device buffers, size updates) through one object.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{FileSystem, FsId};

/// Kind of object a vnode refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    RegularFile,
    Directory,
    CharacterDevice,
    Symlink,
}

/// Filesystem-private state attached to a vnode
pub trait VnodeData: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// In-memory handle to a filesystem object
pub struct Vnode {
    /// Owning filesystem's cache id
    pub fs_id: FsId,
    /// Inode number within that filesystem
    pub inode: u64,
    pub kind: VnodeKind,
    size: AtomicU64,
    /// Back-pointer for dispatching operations
    pub fs: &'static dyn FileSystem,
    /// Filesystem-private context (e.g. the device behind a devfs node)
    private: Mutex<Option<Arc<dyn VnodeData>>>,
}

impl Vnode {
    pub fn new(fs: &'static dyn FileSystem, inode: u64, kind: VnodeKind, size: u64) -> Self {
        Self {
            fs_id: fs.id(),
            inode,
            kind,
            size: AtomicU64::new(size),
            fs,
            private: Mutex::new(None),
        }
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn set_private(&self, data: Arc<dyn VnodeData>) {
        *self.private.lock() = Some(data);
    }

    pub fn private(&self) -> Option<Arc<dyn VnodeData>> {
        self.private.lock().clone()
    }
}

/// Process-wide vnode cache keyed by `(filesystem, inode)`
static VNODE_CACHE: Mutex<BTreeMap<(FsId, u64), Arc<Vnode>>> = Mutex::new(BTreeMap::new());

/// Look up a cached vnode
pub fn cache_get(fs_id: FsId, inode: u64) -> Option<Arc<Vnode>> {
    VNODE_CACHE.lock().get(&(fs_id, inode)).cloned()
}

/// Return the cached vnode for `(fs, inode)`, building it on first use
///
/// The builder runs without the cache lock held only on the miss path of
/// its own key; concurrent callers for the same key receive the same
/// object.
pub fn cache_get_or_insert(
    fs_id: FsId,
    inode: u64,
    build: impl FnOnce() -> Arc<Vnode>,
) -> Arc<Vnode> {
    let mut cache = VNODE_CACHE.lock();
    cache.entry((fs_id, inode)).or_insert_with(build).clone()
}

/// Drop a vnode from the cache (explicit eviction only)
pub fn cache_evict(fs_id: FsId, inode: u64) {
    VNODE_CACHE.lock().remove(&(fs_id, inode));
}


#[cfg(test)]
mod tests {
    use super::testing::TreeFs;
    use super::*;

    #[test]
    fn test_cache_returns_same_object() {
        let fs = TreeFs::build(&[(1, "a", 2, VnodeKind::RegularFile)]);
        let first = fs.find_in_directory(&fs.root(), "a").unwrap().unwrap();
        let second = fs.find_in_directory(&fs.root(), "a").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_eviction_breaks_identity() {
        let fs = TreeFs::build(&[(1, "a", 2, VnodeKind::RegularFile)]);
        let first = fs.find_in_directory(&fs.root(), "a").unwrap().unwrap();
        cache_evict(fs.id(), 2);
        let second = fs.find_in_directory(&fs.root(), "a").unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_size_is_shared_through_cache() {
        let fs = TreeFs::build(&[(1, "a", 2, VnodeKind::RegularFile)]);
        let first = fs.find_in_directory(&fs.root(), "a").unwrap().unwrap();
        let second = fs.find_in_directory(&fs.root(), "a").unwrap().unwrap();
        first.set_size(77);
        assert_eq!(second.size(), 77);
    }
}
