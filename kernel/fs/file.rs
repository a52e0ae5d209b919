//! File descriptors
//!
//! Each task owns an [`FdTable`]. Slots are reused lowest-free-first;
//! `close` clears the slot but keeps it so the next `open` can take it.
//! Vnode references are shared with the cache, so duplicating a table
//! (fork) shares the underlying objects.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};

use super::mount::MountTable;
use super::path::{self, Resolved};
use super::vnode::{Vnode, VnodeKind};

bitflags! {
    /// Open flags (syscall ABI values)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u64 {
        /// Materialize a regular file if the final component is missing
        const CREATE = 1 << 0;
        /// Drop a regular file's contents on open
        const TRUNCATE = 1 << 1;
        /// Start with the offset at end of file
        const APPEND = 1 << 2;
        /// Open for reading and writing
        const READ_WRITE = 1 << 3;
        /// Fail with WouldBlock instead of suspending on empty devices
        const NON_BLOCK = 1 << 4;
    }
}

/// Seek origin (syscall ABI values)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl SeekWhence {
    pub fn from_raw(raw: u64) -> KernelResult<Self> {
        match raw {
            0 => Ok(SeekWhence::Set),
            1 => Ok(SeekWhence::Cur),
            2 => Ok(SeekWhence::End),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// One slot of the descriptor table
#[derive(Clone)]
pub struct FileDescriptor {
    pub present: bool,
    pub offset: u64,
    pub vnode: Option<Arc<Vnode>>,
    pub flags: OpenFlags,
}

impl FileDescriptor {
    const fn empty() -> Self {
        Self {
            present: false,
            offset: 0,
            vnode: None,
            flags: OpenFlags::empty(),
        }
    }
}

/// Per-task descriptor table
#[derive(Clone, Default)]
pub struct FdTable {
    entries: Vec<FileDescriptor>,
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of slots (present or not); descriptor leak checks use this
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&mut self, fd: u64) -> KernelResult<&mut FileDescriptor> {
        self.entries
            .get_mut(fd as usize)
            .filter(|d| d.present)
            .ok_or(KernelError::NoSuchDescriptor)
    }

    /// Vnode behind an open descriptor
    pub fn vnode(&self, fd: u64) -> KernelResult<Arc<Vnode>> {
        self.entries
            .get(fd as usize)
            .filter(|d| d.present)
            .and_then(|d| d.vnode.clone())
            .ok_or(KernelError::NoSuchDescriptor)
    }

    /// Flags a descriptor was opened with
    pub fn flags(&self, fd: u64) -> KernelResult<OpenFlags> {
        self.entries
            .get(fd as usize)
            .filter(|d| d.present)
            .map(|d| d.flags)
            .ok_or(KernelError::NoSuchDescriptor)
    }

    /// Open `path`, reusing the lowest free slot
    pub fn open(
        &mut self,
        table: &MountTable,
        path: &str,
        flags: OpenFlags,
    ) -> KernelResult<u64> {
        let vnode = match path::resolve(table, path)? {
            Resolved::Found(vnode) => vnode,
            Resolved::Missing { parent, name } => {
                if flags.contains(OpenFlags::CREATE) {
                    parent.fs.create(&parent, &name, VnodeKind::RegularFile)?
                } else {
                    return Err(KernelError::NotFound);
                }
            }
        };

        if flags.contains(OpenFlags::TRUNCATE) && vnode.kind == VnodeKind::RegularFile {
            vnode.fs.truncate(&vnode)?;
        }
        let offset = if flags.contains(OpenFlags::APPEND) {
            vnode.size()
        } else {
            0
        };

        let index = match self.entries.iter().position(|d| !d.present) {
            Some(index) => index,
            None => {
                self.entries.push(FileDescriptor::empty());
                self.entries.len() - 1
            }
        };
        self.entries[index] = FileDescriptor {
            present: true,
            offset,
            vnode: Some(vnode),
            flags,
        };
        Ok(index as u64)
    }

    /// Close a descriptor; the slot stays for reuse
    pub fn close(&mut self, fd: u64) -> KernelResult<()> {
        let slot = self.slot(fd)?;
        *slot = FileDescriptor::empty();
        Ok(())
    }

    /// Read at the descriptor's offset, advancing it by the bytes read
    pub fn read(&mut self, fd: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let slot = self.slot(fd)?;
        let vnode = slot.vnode.clone().ok_or(KernelError::NoSuchDescriptor)?;
        let count = vnode.fs.read(&vnode, buf, slot.offset)?;
        slot.offset += count as u64;
        Ok(count)
    }

    /// Write at the descriptor's offset, advancing it by the bytes written
    pub fn write(&mut self, fd: u64, buf: &[u8]) -> KernelResult<usize> {
        let slot = self.slot(fd)?;
        let vnode = slot.vnode.clone().ok_or(KernelError::NoSuchDescriptor)?;
        let count = vnode.fs.write(&vnode, buf, slot.offset)?;
        slot.offset += count as u64;
        Ok(count)
    }

    /// Reposition the offset; never grows the file by itself
    pub fn seek(&mut self, fd: u64, offset: i64, whence: SeekWhence) -> KernelResult<u64> {
        let slot = self.slot(fd)?;
        let vnode = slot.vnode.clone().ok_or(KernelError::NoSuchDescriptor)?;
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => slot.offset as i64,
            SeekWhence::End => vnode.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
        if target < 0 {
            return Err(KernelError::InvalidArgument);
        }
        slot.offset = target as u64;
        Ok(slot.offset)
    }

    /// Duplicate the whole table for fork; vnode references are shared
    pub fn duplicate(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::vnode::testing::TreeFs;
    use super::super::FileSystem;
    use super::*;

    fn table_with_file() -> MountTable {
        let fs = TreeFs::build(&[(1, "a.txt", 2, VnodeKind::RegularFile)]);
        let mut table = MountTable::new();
        table.set_root(fs.root());
        table
    }

    #[test]
    fn test_lowest_free_slot_reuse() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        let a = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        let b = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        let c = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        fds.close(b).unwrap();
        let reused = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        assert_eq!(reused, 1);
        assert_eq!(fds.len(), 3);
    }

    #[test]
    fn test_open_read_close_does_not_leak_slots() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        for _ in 0..10 {
            let fd = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
            let mut buf = [0u8; 4];
            let _ = fds.read(fd, &mut buf).unwrap();
            fds.close(fd).unwrap();
        }
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn test_missing_file_without_create_is_not_found() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        assert_eq!(
            fds.open(&table, "/nope.txt", OpenFlags::empty()),
            Err(KernelError::NotFound)
        );
    }

    #[test]
    fn test_create_materializes_missing_file() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        let fd = fds.open(&table, "/new.txt", OpenFlags::CREATE).unwrap();
        let vnode = fds.vnode(fd).unwrap();
        assert_eq!(vnode.kind, VnodeKind::RegularFile);
        // Re-open without CREATE now succeeds
        let mut other = FdTable::new();
        assert!(other.open(&table, "/new.txt", OpenFlags::empty()).is_ok());
    }

    #[test]
    fn test_append_starts_at_end() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        let fd = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        fds.vnode(fd).unwrap().set_size(40);
        let appending = fds.open(&table, "/a.txt", OpenFlags::APPEND).unwrap();
        assert_eq!(fds.seek(appending, 0, SeekWhence::Cur).unwrap(), 40);
    }

    #[test]
    fn test_seek_variants_and_bounds() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        let fd = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        fds.vnode(fd).unwrap().set_size(100);
        assert_eq!(fds.seek(fd, 10, SeekWhence::Set).unwrap(), 10);
        assert_eq!(fds.seek(fd, 5, SeekWhence::Cur).unwrap(), 15);
        assert_eq!(fds.seek(fd, -3, SeekWhence::End).unwrap(), 97);
        // Seeking past the end is allowed and does not grow the file
        assert_eq!(fds.seek(fd, 7, SeekWhence::End).unwrap(), 107);
        assert_eq!(fds.vnode(fd).unwrap().size(), 100);
        assert_eq!(
            fds.seek(fd, -1, SeekWhence::Set),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_unknown_descriptor() {
        let mut fds = FdTable::new();
        let mut buf = [0u8; 1];
        assert_eq!(fds.read(9, &mut buf), Err(KernelError::NoSuchDescriptor));
        assert_eq!(fds.close(0), Err(KernelError::NoSuchDescriptor));
    }

    #[test]
    fn test_duplicate_shares_vnodes() {
        let table = table_with_file();
        let mut fds = FdTable::new();
        let fd = fds.open(&table, "/a.txt", OpenFlags::empty()).unwrap();
        let copy = fds.duplicate();
        assert!(Arc::ptr_eq(
            &fds.vnode(fd).unwrap(),
            &copy.vnode(fd).unwrap()
        ));
    }
}
