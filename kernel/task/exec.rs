//! Program spawning
//!
//! Builds a fresh task from an ELF executable: a new address space, the
//! loaded image, and the conventional first three descriptors bound to
//! `/dev/tty`.

use crate::elf;
use crate::error::{KernelError, KernelResult};
use crate::fs::{MountTable, OpenFlags};
use crate::mm::AddressSpace;

use super::Task;

/// Load `path` into a new address space and wrap it in a runnable task
///
/// The caller enqueues the result on a scheduler. Descriptors 0/1/2 are
/// opened read-write on `/dev/tty`; a namespace without that device
/// cannot spawn programs.
pub fn spawn_from_elf<A: AddressSpace>(
    table: &MountTable,
    path: &str,
    user: bool,
) -> KernelResult<Task<A>> {
    let mut space = A::new()?;
    let image = elf::load_program(table, path, &mut space)?;
    let mut task = Task::new(space, image.entry, image.stack_ptr, user, true)?;

    for expected in 0..3 {
        let fd = task
            .fds
            .open(table, "/dev/tty", OpenFlags::READ_WRITE)?;
        if fd != expected {
            return Err(KernelError::InvalidArgument);
        }
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::elf::testing::{build_elf, Segment};
    use crate::fs::devfs::DevFs;
    use crate::fs::vnode::testing::TreeFs;
    use crate::fs::{FileSystem, VnodeKind};
    use crate::mm::testing::MockSpace;
    use crate::task::TaskState;
    use crate::tty::Tty;

    fn world_with_program() -> MountTable {
        let root = TreeFs::build(&[
            (1, "bin", 2, VnodeKind::Directory),
            (2, "init", 3, VnodeKind::RegularFile),
            (1, "dev", 4, VnodeKind::Directory),
        ]);
        let mut table = MountTable::new();
        table.set_root(root.root());

        let devfs = DevFs::new();
        devfs.register(Arc::new(Tty::new()));
        let dev = root.find_in_directory(&root.root(), "dev").unwrap().unwrap();
        table.mount(dev, devfs.root());

        let image = build_elf(
            true,
            0x40_0000,
            &[Segment {
                vaddr: 0x40_0000,
                data: b"INIT".to_vec(),
                mem_size: 4,
            }],
            None,
            None,
        );
        let init = root
            .find_in_directory(
                &root.find_in_directory(&root.root(), "bin").unwrap().unwrap(),
                "init",
            )
            .unwrap()
            .unwrap();
        init.fs.write(&init, &image, 0).unwrap();
        table
    }

    #[test]
    fn test_spawn_binds_std_descriptors_to_tty() {
        let table = world_with_program();
        let task: Task<MockSpace> = spawn_from_elf(&table, "/bin/init", true).unwrap();

        assert_eq!(task.state, TaskState::Normal);
        assert_eq!(task.frame.rip, 0x40_0000);
        assert_eq!(task.fds.len(), 3);
        for fd in 0..3 {
            let vnode = task.fds.vnode(fd).unwrap();
            assert_eq!(vnode.kind, VnodeKind::CharacterDevice);
        }
        // All three descriptors share the cached tty vnode
        let tty0 = task.fds.vnode(0).unwrap();
        let tty2 = task.fds.vnode(2).unwrap();
        assert!(Arc::ptr_eq(&tty0, &tty2));
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let table = world_with_program();
        let result: KernelResult<Task<MockSpace>> =
            spawn_from_elf(&table, "/bin/absent", true);
        assert!(matches!(result, Err(KernelError::NotFound)));
    }
}
