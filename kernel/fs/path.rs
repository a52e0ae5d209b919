//! Absolute path traversal
//!
//! Paths are split at `/` into non-empty components and walked from the
//! namespace root, crossing mount points as they are entered. A miss on
//! the final component is not an error: the caller gets the parent
//! directory and the unresolved name so `Open` with `Create` can
//! materialize it.

use alloc::string::{String, ToString};
use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};

use super::mount::MountTable;
use super::vnode::{Vnode, VnodeKind};

/// Outcome of resolving an absolute path
pub enum Resolved {
    /// Every component resolved
    Found(Arc<Vnode>),
    /// All but the final component resolved
    Missing {
        parent: Arc<Vnode>,
        name: String,
    },
}

impl Resolved {
    /// The vnode, or `NotFound` if the final component was missing
    pub fn existing(self) -> KernelResult<Arc<Vnode>> {
        match self {
            Resolved::Found(vnode) => Ok(vnode),
            Resolved::Missing { .. } => Err(KernelError::NotFound),
        }
    }
}

/// Resolve `path` against `table`
///
/// Only absolute paths are accepted. Intermediate components that do not
/// resolve, or that resolve to a non-directory, fail with `NotFound`.
pub fn resolve(table: &MountTable, path: &str) -> KernelResult<Resolved> {
    if !path.starts_with('/') {
        return Err(KernelError::InvalidArgument);
    }
    let root = table.root().ok_or(KernelError::NotFound)?;
    let mut current = table.cross(&root);

    let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
    while let Some(component) = components.next() {
        let is_last = components.peek().is_none();
        if current.kind != VnodeKind::Directory {
            return Err(KernelError::NotFound);
        }
        match current.fs.find_in_directory(&current, component)? {
            Some(next) => {
                current = table.cross(&next);
            }
            None if is_last => {
                return Ok(Resolved::Missing {
                    parent: current,
                    name: component.to_string(),
                });
            }
            None => return Err(KernelError::NotFound),
        }
    }

    Ok(Resolved::Found(current))
}

#[cfg(test)]
mod tests {
    use super::super::vnode::testing::TreeFs;
    use super::super::FileSystem;
    use super::*;

    fn sample_table() -> (&'static TreeFs, MountTable) {
        let fs = TreeFs::build(&[
            (1, "bin", 2, VnodeKind::Directory),
            (2, "init", 3, VnodeKind::RegularFile),
            (1, "dev", 4, VnodeKind::Directory),
        ]);
        let mut table = MountTable::new();
        table.set_root(fs.root());
        (fs, table)
    }

    #[test]
    fn test_resolves_nested_path() {
        let (_fs, table) = sample_table();
        let vnode = resolve(&table, "/bin/init").unwrap().existing().unwrap();
        assert_eq!(vnode.inode, 3);
        assert_eq!(vnode.kind, VnodeKind::RegularFile);
    }

    #[test]
    fn test_root_path_resolves_to_root() {
        let (fs, table) = sample_table();
        let vnode = resolve(&table, "/").unwrap().existing().unwrap();
        assert!(Arc::ptr_eq(&vnode, &fs.root()));
    }

    #[test]
    fn test_relative_path_rejected() {
        let (_fs, table) = sample_table();
        assert!(matches!(
            resolve(&table, "bin/init"),
            Err(KernelError::InvalidArgument)
        ));
    }

    #[test]
    fn test_final_component_miss_returns_parent() {
        let (_fs, table) = sample_table();
        match resolve(&table, "/bin/missing").unwrap() {
            Resolved::Missing { parent, name } => {
                assert_eq!(parent.inode, 2);
                assert_eq!(name, "missing");
            }
            Resolved::Found(_) => panic!("expected a miss"),
        }
    }

    #[test]
    fn test_intermediate_miss_is_not_found() {
        let (_fs, table) = sample_table();
        assert!(matches!(
            resolve(&table, "/no-such/dir"),
            Err(KernelError::NotFound)
        ));
    }

    #[test]
    fn test_lookup_through_file_is_not_found() {
        let (_fs, table) = sample_table();
        assert!(matches!(
            resolve(&table, "/bin/init/deeper"),
            Err(KernelError::NotFound)
        ));
    }

    #[test]
    fn test_mount_crossing_answers_from_mounted_fs() {
        let (host, mut table) = sample_table();
        let guest = TreeFs::build(&[(1, "tty", 2, VnodeKind::CharacterDevice)]);
        let dev = host.find_in_directory(&host.root(), "dev").unwrap().unwrap();
        table.mount(dev, guest.root());

        let tty = resolve(&table, "/dev/tty").unwrap().existing().unwrap();
        assert_eq!(tty.fs_id, guest.id());
        assert_eq!(tty.kind, VnodeKind::CharacterDevice);
    }

    #[test]
    fn test_repeated_slashes_are_collapsed() {
        let (_fs, table) = sample_table();
        let vnode = resolve(&table, "//bin///init").unwrap().existing().unwrap();
        assert_eq!(vnode.inode, 3);
    }
}
