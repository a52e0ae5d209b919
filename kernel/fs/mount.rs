//! Mount table
//!
//! An ordered list of `{mount point, mounted root}` pairs plus the root
//! filesystem's root vnode. Path traversal asks [`MountTable::cross`] at
//! every step so a lookup that lands on a mount point continues inside
//! the mounted filesystem.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::vnode::Vnode;

struct MountPoint {
    mount_point: Arc<Vnode>,
    fs_root: Arc<Vnode>,
}

/// Namespace assembly of mounted filesystems
pub struct MountTable {
    root: Option<Arc<Vnode>>,
    mounts: Vec<MountPoint>,
}

impl MountTable {
    pub const fn new() -> Self {
        Self {
            root: None,
            mounts: Vec::new(),
        }
    }

    /// Install the root filesystem's root directory
    pub fn set_root(&mut self, root: Arc<Vnode>) {
        self.root = Some(root);
    }

    /// Root of the namespace
    pub fn root(&self) -> Option<Arc<Vnode>> {
        self.root.clone()
    }

    /// Mount `fs_root` over the directory `mount_point`
    pub fn mount(&mut self, mount_point: Arc<Vnode>, fs_root: Arc<Vnode>) {
        self.mounts.push(MountPoint {
            mount_point,
            fs_root,
        });
    }

    /// Follow a mount crossing: if `vnode` is a mount point, return the
    /// mounted filesystem's root instead
    pub fn cross(&self, vnode: &Arc<Vnode>) -> Arc<Vnode> {
        for mount in &self.mounts {
            if Arc::ptr_eq(&mount.mount_point, vnode) {
                return mount.fs_root.clone();
            }
        }
        vnode.clone()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::vnode::testing::TreeFs;
    use super::super::vnode::VnodeKind;
    use super::super::FileSystem;
    use super::*;

    #[test]
    fn test_cross_swaps_mount_point_for_fs_root() {
        let host = TreeFs::build(&[(1, "dev", 2, VnodeKind::Directory)]);
        let guest = TreeFs::build(&[]);
        let mount_point = host.find_in_directory(&host.root(), "dev").unwrap().unwrap();

        let mut table = MountTable::new();
        table.set_root(host.root());
        table.mount(mount_point.clone(), guest.root());

        let crossed = table.cross(&mount_point);
        assert!(Arc::ptr_eq(&crossed, &guest.root()));
        // Non-mount-point vnodes pass through unchanged
        let root = host.root();
        assert!(Arc::ptr_eq(&table.cross(&root), &root));
    }
}
