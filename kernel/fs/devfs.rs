//! Device filesystem
//!
//! A synthetic filesystem whose root directory holds one character-device
//! node per registered device. Reads and writes forward to the device;
//! offsets are meaningless and ignored. Creating or truncating device
//! nodes is not supported.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::waitqueue::WaitQueue;

use super::vnode::{cache_get_or_insert, Vnode, VnodeData, VnodeKind};
use super::{alloc_fs_id, DirEntryInfo, FileSystem, FsId};

/// A registered character device
pub trait CharDevice: Send + Sync {
    /// Name of the node under the devfs root
    fn name(&self) -> &str;

    /// Read available bytes; `WouldBlock` when nothing is buffered
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;

    /// Write bytes; never blocks
    fn write(&self, buf: &[u8]) -> KernelResult<usize>;

    /// Queue a blocked reader registers on before suspending
    fn read_queue(&self) -> Option<&WaitQueue> {
        None
    }

    /// Store terminal settings (the raw four flag words)
    fn set_terminal_settings(&self, raw: [u8; 16]) -> KernelResult<()> {
        let _ = raw;
        Err(KernelError::NotSupported)
    }
}

/// Vnode private context: the device behind a devfs node
struct DeviceNode {
    device: Arc<dyn CharDevice>,
}

impl VnodeData for DeviceNode {
    fn as_any(&self) -> &dyn Any {
        self as &dyn Any
    }
}

const DEVFS_ROOT_INODE: u64 = 1;

/// The device filesystem instance
pub struct DevFs {
    id: FsId,
    devices: Mutex<Vec<(u64, Arc<dyn CharDevice>)>>,
    next_inode: AtomicU64,
}

impl DevFs {
    /// Create the filesystem; devices are registered afterwards at boot
    pub fn new() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self {
            id: alloc_fs_id(),
            devices: Mutex::new(Vec::new()),
            next_inode: AtomicU64::new(DEVFS_ROOT_INODE + 1),
        }))
    }

    /// Register a device and build its cached vnode
    pub fn register(&'static self, device: Arc<dyn CharDevice>) -> Arc<Vnode> {
        let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
        self.devices.lock().push((inode, device.clone()));
        let vnode = cache_get_or_insert(self.id, inode, || {
            Arc::new(Vnode::new(self, inode, VnodeKind::CharacterDevice, 0))
        });
        vnode.set_private(Arc::new(DeviceNode { device }));
        vnode
    }

    fn device_vnode(&'static self, inode: u64) -> KernelResult<Arc<Vnode>> {
        // register() caches every device vnode up front
        super::vnode::cache_get(self.id, inode).ok_or(KernelError::NotFound)
    }
}

/// The device behind a devfs vnode, if it is one
pub fn device_of(vnode: &Vnode) -> Option<Arc<dyn CharDevice>> {
    let private = vnode.private()?;
    let node = private.as_any().downcast_ref::<DeviceNode>()?;
    Some(node.device.clone())
}

impl FileSystem for DevFs {
    fn id(&self) -> FsId {
        self.id
    }

    fn root(&self) -> Arc<Vnode> {
        let fs: &'static Self = unsafe { &*(self as *const Self) };
        cache_get_or_insert(self.id, DEVFS_ROOT_INODE, || {
            Arc::new(Vnode::new(fs, DEVFS_ROOT_INODE, VnodeKind::Directory, 0))
        })
    }

    fn read(&self, vnode: &Vnode, buf: &mut [u8], _offset: u64) -> KernelResult<usize> {
        let device = device_of(vnode).ok_or(KernelError::NotSupported)?;
        device.read(buf)
    }

    fn write(&self, vnode: &Vnode, buf: &[u8], _offset: u64) -> KernelResult<usize> {
        let device = device_of(vnode).ok_or(KernelError::NotSupported)?;
        device.write(buf)
    }

    fn find_in_directory(&self, dir: &Vnode, name: &str) -> KernelResult<Option<Arc<Vnode>>> {
        if dir.inode != DEVFS_ROOT_INODE {
            return Err(KernelError::InvalidArgument);
        }
        let fs: &'static Self = unsafe { &*(self as *const Self) };
        let inode = self
            .devices
            .lock()
            .iter()
            .find(|(_, device)| device.name() == name)
            .map(|(inode, _)| *inode);
        match inode {
            Some(inode) => Ok(Some(fs.device_vnode(inode)?)),
            None => Ok(None),
        }
    }

    fn list_directory(&self, dir: &Vnode) -> KernelResult<Vec<DirEntryInfo>> {
        if dir.inode != DEVFS_ROOT_INODE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|(inode, device)| DirEntryInfo {
                name: String::from(device.name()),
                inode: *inode,
                kind: VnodeKind::CharacterDevice,
            })
            .collect())
    }

    // create/truncate/remove keep the NotSupported defaults: the device
    // registry is fixed at boot
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    struct EchoDevice {
        buffered: Mutex<Vec<u8>>,
    }

    impl CharDevice for EchoDevice {
        fn name(&self) -> &str {
            "echo"
        }

        fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
            let mut buffered = self.buffered.lock();
            if buffered.is_empty() {
                return Err(KernelError::WouldBlock);
            }
            let count = buf.len().min(buffered.len());
            for (slot, byte) in buf.iter_mut().zip(buffered.drain(..count)) {
                *slot = byte;
            }
            Ok(count)
        }

        fn write(&self, buf: &[u8]) -> KernelResult<usize> {
            self.buffered.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn fs_with_echo() -> &'static DevFs {
        let fs = DevFs::new();
        fs.register(Arc::new(EchoDevice {
            buffered: Mutex::new(vec![]),
        }));
        fs
    }

    #[test]
    fn test_lookup_and_forwarding() {
        let fs = fs_with_echo();
        let root = fs.root();
        let node = fs.find_in_directory(&root, "echo").unwrap().unwrap();
        assert_eq!(node.kind, VnodeKind::CharacterDevice);

        assert_eq!(fs.write(&node, b"hi", 0).unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(&node, &mut buf, 99).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_unknown_device_is_none() {
        let fs = fs_with_echo();
        assert!(fs.find_in_directory(&fs.root(), "nope").unwrap().is_none());
    }

    #[test]
    fn test_create_and_truncate_not_supported() {
        let fs = fs_with_echo();
        let root = fs.root();
        assert_eq!(
            fs.create(&root, "new", VnodeKind::CharacterDevice).map(|_| ()),
            Err(KernelError::NotSupported)
        );
        let node = fs.find_in_directory(&root, "echo").unwrap().unwrap();
        assert_eq!(fs.truncate(&node), Err(KernelError::NotSupported));
    }

    #[test]
    fn test_listing_names_devices() {
        let fs = fs_with_echo();
        let listing = fs.list_directory(&fs.root()).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "echo");
    }

    #[test]
    fn test_empty_read_would_block() {
        let fs = fs_with_echo();
        let node = fs.find_in_directory(&fs.root(), "echo").unwrap().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read(&node, &mut buf, 0), Err(KernelError::WouldBlock));
    }
}
