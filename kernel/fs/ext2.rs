//! Ext2 filesystem backend
//!
//! Reads and writes a standard revision-1 ext2 image bit-exactly
//! (little-endian throughout). Inode data is addressed through the
//! classic 12-direct / single / double / triple indirect scheme; holes
//! read back as zeroes and are only materialized when written.
//!
//! Writes allocate from the owning block group's bitmaps first and fall
//! back to neighbouring groups when it is full.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::storage::BlockDevice;

use super::vnode::{cache_get_or_insert, Vnode, VnodeKind};
use super::{alloc_fs_id, DirEntryInfo, FileSystem, FsId};

/// Superblock location and signature
const SUPERBLOCK_OFFSET: u64 = 1024;
const EXT2_SIGNATURE: u16 = 0xEF53;

/// Root directory inode number
pub const ROOT_INODE: u32 = 2;

/// Incompat feature: directory entries carry a file-type byte.
/// This is the only required feature the driver understands.
const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

/// Direct block pointers per inode
const DIRECT_BLOCKS: u64 = 12;

// Inode mode bits (type nibble)
const S_IFMT: u16 = 0xF000;
const S_IFREG: u16 = 0x8000;
const S_IFDIR: u16 = 0x4000;
const S_IFCHR: u16 = 0x2000;
const S_IFLNK: u16 = 0xA000;

// Directory entry file-type byte
const FT_REGULAR: u8 = 1;
const FT_DIRECTORY: u8 = 2;
const FT_CHARDEV: u8 = 3;
const FT_SYMLINK: u8 = 7;

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Fields of the superblock the driver works with
#[derive(Debug, Clone)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u32,
    first_data_block: u32,
    block_size: u64,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
}

impl Superblock {
    fn parse(raw: &[u8]) -> KernelResult<Self> {
        if read_u16(raw, 56) != EXT2_SIGNATURE {
            return Err(KernelError::InvalidFormat);
        }
        let required = read_u32(raw, 96);
        if required & !FEATURE_INCOMPAT_FILETYPE != 0 {
            // Unknown required feature: refuse the mount
            return Err(KernelError::NotSupported);
        }
        let rev_level = read_u32(raw, 76);
        let inode_size = if rev_level >= 1 { read_u16(raw, 88) } else { 128 };
        Ok(Self {
            inodes_count: read_u32(raw, 0),
            blocks_count: read_u32(raw, 4),
            first_data_block: read_u32(raw, 20),
            block_size: 1024u64 << read_u32(raw, 24),
            blocks_per_group: read_u32(raw, 32),
            inodes_per_group: read_u32(raw, 40),
            inode_size,
        })
    }

    fn group_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }
}

/// One block group descriptor (32 bytes on disk)
#[derive(Debug, Clone, Copy)]
struct GroupDesc {
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    free_blocks: u16,
    free_inodes: u16,
}

/// On-disk inode image
#[derive(Debug, Clone)]
struct DiskInode {
    mode: u16,
    size: u32,
    links: u16,
    sectors: u32,
    block: [u32; 15],
}

impl DiskInode {
    fn parse(raw: &[u8]) -> Self {
        let mut block = [0u32; 15];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_u32(raw, 40 + i * 4);
        }
        Self {
            mode: read_u16(raw, 0),
            size: read_u32(raw, 4),
            links: read_u16(raw, 26),
            sectors: read_u32(raw, 28),
            block,
        }
    }

    fn serialize(&self, raw: &mut [u8]) {
        write_u16(raw, 0, self.mode);
        write_u32(raw, 4, self.size);
        write_u16(raw, 26, self.links);
        write_u32(raw, 28, self.sectors);
        for (i, slot) in self.block.iter().enumerate() {
            write_u32(raw, 40 + i * 4, *slot);
        }
    }

    fn kind(&self) -> KernelResult<VnodeKind> {
        match self.mode & S_IFMT {
            S_IFREG => Ok(VnodeKind::RegularFile),
            S_IFDIR => Ok(VnodeKind::Directory),
            S_IFCHR => Ok(VnodeKind::CharacterDevice),
            S_IFLNK => Ok(VnodeKind::Symlink),
            _ => Err(KernelError::InvalidFormat),
        }
    }
}

fn kind_to_mode(kind: VnodeKind) -> u16 {
    match kind {
        VnodeKind::RegularFile => S_IFREG | 0o644,
        VnodeKind::Directory => S_IFDIR | 0o755,
        VnodeKind::CharacterDevice => S_IFCHR | 0o666,
        VnodeKind::Symlink => S_IFLNK | 0o777,
    }
}

fn kind_to_file_type(kind: VnodeKind) -> u8 {
    match kind {
        VnodeKind::RegularFile => FT_REGULAR,
        VnodeKind::Directory => FT_DIRECTORY,
        VnodeKind::CharacterDevice => FT_CHARDEV,
        VnodeKind::Symlink => FT_SYMLINK,
    }
}

fn file_type_to_kind(file_type: u8) -> VnodeKind {
    match file_type {
        FT_DIRECTORY => VnodeKind::Directory,
        FT_CHARDEV => VnodeKind::CharacterDevice,
        FT_SYMLINK => VnodeKind::Symlink,
        _ => VnodeKind::RegularFile,
    }
}

/// A mounted ext2 filesystem
pub struct Ext2Fs {
    id: FsId,
    device: Arc<dyn BlockDevice>,
    sb: Superblock,
    /// Byte offset of the block group descriptor table
    bgdt_offset: u64,
    /// Serializes allocation and directory mutation
    write_lock: Mutex<()>,
}

impl Ext2Fs {
    /// Mount the filesystem on `device`, validating the superblock
    ///
    /// The returned reference is leaked: a mounted filesystem lives for
    /// the rest of the kernel's life (unmount is not supported).
    pub fn mount(device: Arc<dyn BlockDevice>) -> KernelResult<&'static Self> {
        let mut raw = [0u8; 1024];
        device.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        let sb = Superblock::parse(&raw)?;

        // Descriptor table starts at block 2 for 1 KiB blocks, else block 1
        let bgdt_block = if sb.block_size == 1024 { 2 } else { 1 };
        let bgdt_offset = bgdt_block * sb.block_size;

        Ok(alloc::boxed::Box::leak(alloc::boxed::Box::new(Self {
            id: alloc_fs_id(),
            device,
            sb,
            bgdt_offset,
            write_lock: Mutex::new(()),
        })))
    }

    pub fn block_size(&self) -> u64 {
        self.sb.block_size
    }

    fn block_offset(&self, block: u32) -> u64 {
        block as u64 * self.sb.block_size
    }

    // ------------------------------------------------------------------
    // Group descriptors and bitmaps
    // ------------------------------------------------------------------

    fn group_desc(&self, group: u32) -> KernelResult<GroupDesc> {
        let mut raw = [0u8; 32];
        self.device.read_at(self.bgdt_offset + group as u64 * 32, &mut raw)?;
        Ok(GroupDesc {
            block_bitmap: read_u32(&raw, 0),
            inode_bitmap: read_u32(&raw, 4),
            inode_table: read_u32(&raw, 8),
            free_blocks: read_u16(&raw, 12),
            free_inodes: read_u16(&raw, 14),
        })
    }

    fn adjust_group_free(&self, group: u32, blocks: i32, inodes: i32) -> KernelResult<()> {
        let offset = self.bgdt_offset + group as u64 * 32;
        let mut raw = [0u8; 32];
        self.device.read_at(offset, &mut raw)?;
        let free_blocks = (read_u16(&raw, 12) as i32 + blocks) as u16;
        let free_inodes = (read_u16(&raw, 14) as i32 + inodes) as u16;
        write_u16(&mut raw, 12, free_blocks);
        write_u16(&mut raw, 14, free_inodes);
        self.device.write_at(offset, &raw)?;
        self.adjust_super_free(blocks, inodes)
    }

    fn adjust_super_free(&self, blocks: i32, inodes: i32) -> KernelResult<()> {
        let mut raw = [0u8; 8];
        self.device.read_at(SUPERBLOCK_OFFSET + 12, &mut raw)?;
        let free_blocks = (read_u32(&raw, 0) as i64 + blocks as i64) as u32;
        let free_inodes = (read_u32(&raw, 4) as i64 + inodes as i64) as u32;
        write_u32(&mut raw, 0, free_blocks);
        write_u32(&mut raw, 4, free_inodes);
        self.device.write_at(SUPERBLOCK_OFFSET + 12, &raw)
    }

    /// Claim the first clear bit in a bitmap block; returns the bit index
    fn claim_bit(&self, bitmap_block: u32, bits: u32) -> KernelResult<Option<u32>> {
        let mut bitmap = vec![0u8; self.sb.block_size as usize];
        self.device.read_at(self.block_offset(bitmap_block), &mut bitmap)?;
        for bit in 0..bits {
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            if bitmap[byte] & mask == 0 {
                bitmap[byte] |= mask;
                self.device
                    .write_at(self.block_offset(bitmap_block) + byte as u64, &bitmap[byte..=byte])?;
                return Ok(Some(bit));
            }
        }
        Ok(None)
    }

    fn release_bit(&self, bitmap_block: u32, bit: u32) -> KernelResult<()> {
        let offset = self.block_offset(bitmap_block) + (bit / 8) as u64;
        let mut byte = [0u8; 1];
        self.device.read_at(offset, &mut byte)?;
        byte[0] &= !(1u8 << (bit % 8));
        self.device.write_at(offset, &byte)
    }

    /// Allocate one block, preferring `hint_group`, then its neighbours
    fn alloc_block(&self, hint_group: u32) -> KernelResult<u32> {
        let groups = self.sb.group_count();
        for step in 0..groups {
            let group = (hint_group + step) % groups;
            let desc = self.group_desc(group)?;
            if desc.free_blocks == 0 {
                continue;
            }
            let first = self.sb.first_data_block + group * self.sb.blocks_per_group;
            let bits = self
                .sb
                .blocks_per_group
                .min(self.sb.blocks_count.saturating_sub(first));
            if let Some(bit) = self.claim_bit(desc.block_bitmap, bits)? {
                self.adjust_group_free(group, -1, 0)?;
                return Ok(first + bit);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    fn free_block(&self, block: u32) -> KernelResult<()> {
        let group = (block - self.sb.first_data_block) / self.sb.blocks_per_group;
        let bit = (block - self.sb.first_data_block) % self.sb.blocks_per_group;
        let desc = self.group_desc(group)?;
        self.release_bit(desc.block_bitmap, bit)?;
        self.adjust_group_free(group, 1, 0)
    }

    /// Allocate one block and zero it (for indirect blocks and fresh dirs)
    fn alloc_zeroed_block(&self, hint_group: u32) -> KernelResult<u32> {
        let block = self.alloc_block(hint_group)?;
        let zeroes = vec![0u8; self.sb.block_size as usize];
        self.device.write_at(self.block_offset(block), &zeroes)?;
        Ok(block)
    }

    fn alloc_inode(&self, hint_group: u32) -> KernelResult<u32> {
        let groups = self.sb.group_count();
        for step in 0..groups {
            let group = (hint_group + step) % groups;
            let desc = self.group_desc(group)?;
            if desc.free_inodes == 0 {
                continue;
            }
            let bits = self
                .sb
                .inodes_per_group
                .min(self.sb.inodes_count.saturating_sub(group * self.sb.inodes_per_group));
            if let Some(bit) = self.claim_bit(desc.inode_bitmap, bits)? {
                self.adjust_group_free(group, 0, -1)?;
                return Ok(group * self.sb.inodes_per_group + bit + 1);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    fn free_inode(&self, ino: u32) -> KernelResult<()> {
        let group = (ino - 1) / self.sb.inodes_per_group;
        let bit = (ino - 1) % self.sb.inodes_per_group;
        let desc = self.group_desc(group)?;
        self.release_bit(desc.inode_bitmap, bit)?;
        self.adjust_group_free(group, 0, 1)
    }

    // ------------------------------------------------------------------
    // Inode table access
    // ------------------------------------------------------------------

    fn inode_group(&self, ino: u32) -> u32 {
        (ino - 1) / self.sb.inodes_per_group
    }

    fn inode_offset(&self, ino: u32) -> KernelResult<u64> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(KernelError::InvalidFormat);
        }
        let group = self.inode_group(ino);
        let index = (ino - 1) % self.sb.inodes_per_group;
        let desc = self.group_desc(group)?;
        Ok(self.block_offset(desc.inode_table) + index as u64 * self.sb.inode_size as u64)
    }

    fn load_inode(&self, ino: u32) -> KernelResult<DiskInode> {
        let mut raw = [0u8; 128];
        self.device.read_at(self.inode_offset(ino)?, &mut raw)?;
        Ok(DiskInode::parse(&raw))
    }

    fn store_inode(&self, ino: u32, inode: &DiskInode) -> KernelResult<()> {
        let offset = self.inode_offset(ino)?;
        let mut raw = [0u8; 128];
        self.device.read_at(offset, &mut raw)?;
        inode.serialize(&mut raw);
        self.device.write_at(offset, &raw)
    }

    // ------------------------------------------------------------------
    // Block mapping (direct / single / double / triple indirect)
    // ------------------------------------------------------------------

    fn read_ptr(&self, block: u32, index: u64) -> KernelResult<u32> {
        let mut raw = [0u8; 4];
        self.device.read_at(self.block_offset(block) + index * 4, &mut raw)?;
        Ok(read_u32(&raw, 0))
    }

    fn write_ptr(&self, block: u32, index: u64, value: u32) -> KernelResult<()> {
        self.device
            .write_at(self.block_offset(block) + index * 4, &value.to_le_bytes())
    }

    /// Map a file block index to a disk block
    ///
    /// With `allocate`, missing data blocks and any missing indirect
    /// blocks on the way are allocated (indirect blocks zeroed) and the
    /// in-memory inode is updated; the caller persists it. Without
    /// `allocate`, a hole maps to `None`.
    fn map_block(
        &self,
        inode: &mut DiskInode,
        index: u64,
        allocate: bool,
        hint_group: u32,
    ) -> KernelResult<Option<u32>> {
        let n = self.sb.block_size / 4;

        // (inode slot, chain of per-level indices)
        let (slot, chain) = if index < DIRECT_BLOCKS {
            (index as usize, Vec::new())
        } else if index < DIRECT_BLOCKS + n {
            (12, vec![index - DIRECT_BLOCKS])
        } else if index < DIRECT_BLOCKS + n + n * n {
            let rel = index - DIRECT_BLOCKS - n;
            (13, vec![rel / n, rel % n])
        } else {
            let rel = index - DIRECT_BLOCKS - n - n * n;
            if rel >= n * n * n {
                return Err(KernelError::InvalidArgument);
            }
            (14, vec![rel / (n * n), (rel / n) % n, rel % n])
        };

        let sectors_per_block = (self.sb.block_size / 512) as u32;

        let mut current = inode.block[slot];
        if current == 0 {
            if !allocate {
                return Ok(None);
            }
            // Fresh blocks are zeroed so the unwritten tail of a partial
            // write reads back as a hole would
            current = self.alloc_zeroed_block(hint_group)?;
            inode.block[slot] = current;
            inode.sectors += sectors_per_block;
        }

        for &level_index in chain.iter() {
            let mut next = self.read_ptr(current, level_index)?;
            if next == 0 {
                if !allocate {
                    return Ok(None);
                }
                next = self.alloc_zeroed_block(hint_group)?;
                self.write_ptr(current, level_index, next)?;
                inode.sectors += sectors_per_block;
            }
            current = next;
        }

        Ok(Some(current))
    }

    /// Free every data and indirect block of an inode
    fn release_blocks(&self, inode: &mut DiskInode) -> KernelResult<()> {
        fn walk(fs: &Ext2Fs, block: u32, depth: u32) -> KernelResult<()> {
            if depth > 0 {
                let n = fs.sb.block_size / 4;
                for i in 0..n {
                    let child = fs.read_ptr(block, i)?;
                    if child != 0 {
                        walk(fs, child, depth - 1)?;
                    }
                }
            }
            fs.free_block(block)
        }

        for slot in 0..15 {
            let block = inode.block[slot];
            if block == 0 {
                continue;
            }
            let depth = match slot {
                0..=11 => 0,
                12 => 1,
                13 => 2,
                _ => 3,
            };
            walk(self, block, depth)?;
            inode.block[slot] = 0;
        }
        inode.sectors = 0;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inode data I/O
    // ------------------------------------------------------------------

    fn read_inode_data(
        &self,
        inode: &DiskInode,
        buf: &mut [u8],
        offset: u64,
    ) -> KernelResult<usize> {
        let size = inode.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let count = buf.len().min((size - offset) as usize);
        let bs = self.sb.block_size;

        // map_block without allocation never mutates, but shares the
        // signature with the write path
        let mut inode = inode.clone();
        let mut done = 0usize;
        while done < count {
            let pos = offset + done as u64;
            let in_block = pos % bs;
            let span = count - done;
            let span = span.min((bs - in_block) as usize);
            let chunk = &mut buf[done..done + span];
            match self.map_block(&mut inode, pos / bs, false, 0)? {
                Some(block) => {
                    self.device.read_at(self.block_offset(block) + in_block, chunk)?;
                }
                None => chunk.fill(0),
            }
            done += span;
        }
        Ok(count)
    }

    fn write_inode_data(
        &self,
        ino: u32,
        inode: &mut DiskInode,
        buf: &[u8],
        offset: u64,
    ) -> KernelResult<usize> {
        let _guard = self.write_lock.lock();
        let bs = self.sb.block_size;
        let hint = self.inode_group(ino);

        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(KernelError::InvalidArgument)?;
        if end > u32::MAX as u64 {
            return Err(KernelError::InvalidArgument);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_block = pos % bs;
            let span = (buf.len() - done).min((bs - in_block) as usize);
            let block = self
                .map_block(inode, pos / bs, true, hint)?
                .ok_or(KernelError::IoError)?;
            self.device
                .write_at(self.block_offset(block) + in_block, &buf[done..done + span])?;
            done += span;
        }

        if end > inode.size as u64 {
            inode.size = end as u32;
        }
        self.store_inode(ino, inode)?;
        Ok(done)
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    fn dir_entries(&self, dir: &DiskInode) -> KernelResult<Vec<(u32, u8, Vec<u8>)>> {
        let mut data = vec![0u8; dir.size as usize];
        self.read_inode_data(dir, &mut data, 0)?;
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            let ino = read_u32(&data, pos);
            let rec_len = read_u16(&data, pos + 4) as usize;
            let name_len = data[pos + 6] as usize;
            let file_type = data[pos + 7];
            if rec_len < 8 || 8 + name_len > rec_len || pos + rec_len > data.len() {
                return Err(KernelError::InvalidFormat);
            }
            if ino != 0 {
                entries.push((ino, file_type, data[pos + 8..pos + 8 + name_len].to_vec()));
            }
            pos += rec_len;
        }
        Ok(entries)
    }

    fn find_entry(&self, dir: &DiskInode, name: &str) -> KernelResult<Option<(u32, u8)>> {
        for (ino, file_type, entry_name) in self.dir_entries(dir)? {
            if entry_name == name.as_bytes() {
                return Ok(Some((ino, file_type)));
            }
        }
        Ok(None)
    }

    /// Needed record length for a name, padded to a 4-byte stride
    fn record_len(name_len: usize) -> usize {
        (8 + name_len).next_multiple_of(4)
    }

    /// Append a directory entry, splitting the trailing free record
    fn insert_entry(
        &self,
        dir_ino: u32,
        dir: &mut DiskInode,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> KernelResult<()> {
        if name.is_empty() || name.len() > 255 || name.contains('/') {
            return Err(KernelError::InvalidArgument);
        }
        let bs = self.sb.block_size as usize;
        let needed = Self::record_len(name.len());

        // Look for room in the last used block
        if dir.size > 0 {
            let last_block_offset = dir.size as u64 - bs as u64;
            let mut block = vec![0u8; bs];
            self.read_inode_data(dir, &mut block, last_block_offset)?;

            let mut pos = 0usize;
            while pos + 8 <= bs {
                let rec_len = read_u16(&block, pos + 4) as usize;
                if rec_len < 8 || pos + rec_len > bs {
                    return Err(KernelError::InvalidFormat);
                }
                if pos + rec_len == bs {
                    // Trailing record: split its slack if it fits
                    let entry_ino = read_u32(&block, pos);
                    let name_len = block[pos + 6] as usize;
                    let used = if entry_ino == 0 { 0 } else { Self::record_len(name_len) };
                    if rec_len - used >= needed {
                        let insert_at = if used == 0 {
                            pos
                        } else {
                            write_u16(&mut block, pos + 4, used as u16);
                            pos + used
                        };
                        let new_rec = bs - insert_at;
                        write_u32(&mut block, insert_at, ino);
                        write_u16(&mut block, insert_at + 4, new_rec as u16);
                        block[insert_at + 6] = name.len() as u8;
                        block[insert_at + 7] = file_type;
                        block[insert_at + 8..insert_at + 8 + name.len()]
                            .copy_from_slice(name.as_bytes());
                        self.write_inode_data(dir_ino, dir, &block, last_block_offset)?;
                        return Ok(());
                    }
                    break;
                }
                pos += rec_len;
            }
        }

        // No slack: append a fresh block holding a single spanning record
        let mut block = vec![0u8; bs];
        write_u32(&mut block, 0, ino);
        write_u16(&mut block, 4, bs as u16);
        block[6] = name.len() as u8;
        block[7] = file_type;
        block[8..8 + name.len()].copy_from_slice(name.as_bytes());
        self.write_inode_data(dir_ino, dir, &block, dir.size as u64)?;
        Ok(())
    }

    /// Clear a directory entry, folding its record into the predecessor
    fn erase_entry(&self, dir_ino: u32, dir: &mut DiskInode, name: &str) -> KernelResult<u32> {
        let bs = self.sb.block_size as usize;
        let blocks = (dir.size as u64).div_ceil(bs as u64);
        for block_index in 0..blocks {
            let mut block = vec![0u8; bs];
            self.read_inode_data(dir, &mut block, block_index * bs as u64)?;
            let mut pos = 0usize;
            let mut prev: Option<usize> = None;
            while pos + 8 <= bs {
                let ino = read_u32(&block, pos);
                let rec_len = read_u16(&block, pos + 4) as usize;
                let name_len = block[pos + 6] as usize;
                if rec_len < 8 || 8 + name_len > rec_len || pos + rec_len > bs {
                    return Err(KernelError::InvalidFormat);
                }
                if ino != 0 && &block[pos + 8..pos + 8 + name_len] == name.as_bytes() {
                    match prev {
                        Some(prev_pos) => {
                            let merged = read_u16(&block, prev_pos + 4) as usize + rec_len;
                            write_u16(&mut block, prev_pos + 4, merged as u16);
                        }
                        None => write_u32(&mut block, pos, 0),
                    }
                    self.write_inode_data(dir_ino, dir, &block, block_index * bs as u64)?;
                    return Ok(ino);
                }
                prev = Some(pos);
                pos += rec_len;
            }
        }
        Err(KernelError::NotFound)
    }

    // ------------------------------------------------------------------
    // Vnodes
    // ------------------------------------------------------------------

    fn vnode_for(&'static self, ino: u32) -> KernelResult<Arc<Vnode>> {
        let inode = self.load_inode(ino)?;
        let kind = inode.kind()?;
        Ok(cache_get_or_insert(self.id, ino as u64, || {
            Arc::new(Vnode::new(self, ino as u64, kind, inode.size as u64))
        }))
    }

    /// Root directory vnode; entry point used when mounting as root
    pub fn root_vnode(&'static self) -> KernelResult<Arc<Vnode>> {
        self.vnode_for(ROOT_INODE)
    }
}

impl FileSystem for Ext2Fs {
    fn id(&self) -> FsId {
        self.id
    }

    fn root(&self) -> Arc<Vnode> {
        let fs: &'static Self = unsafe { &*(self as *const Self) };
        fs.root_vnode().expect("ext2 root inode unreadable")
    }

    fn read(&self, vnode: &Vnode, buf: &mut [u8], offset: u64) -> KernelResult<usize> {
        let inode = self.load_inode(vnode.inode as u32)?;
        self.read_inode_data(&inode, buf, offset)
    }

    fn write(&self, vnode: &Vnode, buf: &[u8], offset: u64) -> KernelResult<usize> {
        let ino = vnode.inode as u32;
        let mut inode = self.load_inode(ino)?;
        let count = self.write_inode_data(ino, &mut inode, buf, offset)?;
        vnode.set_size(inode.size as u64);
        Ok(count)
    }

    fn find_in_directory(&self, dir: &Vnode, name: &str) -> KernelResult<Option<Arc<Vnode>>> {
        if dir.kind != VnodeKind::Directory {
            return Err(KernelError::InvalidArgument);
        }
        let fs: &'static Self = unsafe { &*(self as *const Self) };
        let dir_inode = self.load_inode(dir.inode as u32)?;
        match self.find_entry(&dir_inode, name)? {
            Some((ino, _)) => Ok(Some(fs.vnode_for(ino)?)),
            None => Ok(None),
        }
    }

    fn list_directory(&self, dir: &Vnode) -> KernelResult<Vec<DirEntryInfo>> {
        if dir.kind != VnodeKind::Directory {
            return Err(KernelError::InvalidArgument);
        }
        let dir_inode = self.load_inode(dir.inode as u32)?;
        let mut listing = Vec::new();
        for (ino, file_type, name) in self.dir_entries(&dir_inode)? {
            listing.push(DirEntryInfo {
                name: alloc::string::String::from_utf8_lossy(&name).into_owned(),
                inode: ino as u64,
                kind: file_type_to_kind(file_type),
            });
        }
        Ok(listing)
    }

    fn create(&self, dir: &Vnode, name: &str, kind: VnodeKind) -> KernelResult<Arc<Vnode>> {
        if dir.kind != VnodeKind::Directory {
            return Err(KernelError::InvalidArgument);
        }
        let fs: &'static Self = unsafe { &*(self as *const Self) };
        let dir_ino = dir.inode as u32;
        let mut dir_inode = self.load_inode(dir_ino)?;
        if self.find_entry(&dir_inode, name)?.is_some() {
            return Err(KernelError::InvalidArgument);
        }

        let ino = self.alloc_inode(self.inode_group(dir_ino))?;
        let fresh = DiskInode {
            mode: kind_to_mode(kind),
            size: 0,
            links: 1,
            sectors: 0,
            block: [0; 15],
        };
        self.store_inode(ino, &fresh)?;
        self.insert_entry(dir_ino, &mut dir_inode, name, ino, kind_to_file_type(kind))?;
        dir.set_size(dir_inode.size as u64);
        fs.vnode_for(ino)
    }

    fn truncate(&self, vnode: &Vnode) -> KernelResult<()> {
        let _guard = self.write_lock.lock();
        let ino = vnode.inode as u32;
        let mut inode = self.load_inode(ino)?;
        self.release_blocks(&mut inode)?;
        inode.size = 0;
        self.store_inode(ino, &inode)?;
        vnode.set_size(0);
        Ok(())
    }

    fn remove(&self, dir: &Vnode, name: &str) -> KernelResult<()> {
        if dir.kind != VnodeKind::Directory {
            return Err(KernelError::InvalidArgument);
        }
        let dir_ino = dir.inode as u32;
        let mut dir_inode = self.load_inode(dir_ino)?;
        let ino = self.erase_entry(dir_ino, &mut dir_inode, name)?;

        let _guard = self.write_lock.lock();
        let mut victim = self.load_inode(ino)?;
        self.release_blocks(&mut victim)?;
        victim.size = 0;
        victim.links = 0;
        self.store_inode(ino, &victim)?;
        self.free_inode(ino)?;
        super::vnode::cache_evict(self.id, ino as u64);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::testing::{build_image, mount_test_image};
    use super::*;
    use crate::storage::testing::MemDisk;

    fn names(fs: &'static Ext2Fs) -> Vec<String> {
        let root = fs.root_vnode().unwrap();
        let mut names: Vec<String> = fs
            .list_directory(&root)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_mount_rejects_bad_signature() {
        let mut image = build_image();
        image[1024 + 56] = 0;
        let disk = Arc::new(MemDisk::from_image(image));
        assert!(matches!(
            Ext2Fs::mount(disk).map(|_| ()),
            Err(KernelError::InvalidFormat)
        ));
    }

    #[test]
    fn test_mount_rejects_unknown_required_feature() {
        let mut image = build_image();
        // Set an incompat bit the driver does not know (compression, 0x1)
        image[1024 + 96] |= 0x1;
        let disk = Arc::new(MemDisk::from_image(image));
        assert!(matches!(
            Ext2Fs::mount(disk).map(|_| ()),
            Err(KernelError::NotSupported)
        ));
    }

    #[test]
    fn test_root_listing_has_dot_entries() {
        let fs = mount_test_image();
        assert_eq!(names(fs), vec![String::from("."), String::from("..")]);
    }

    #[test]
    fn test_create_write_read_roundtrip() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        let file = fs.create(&root, "a.txt", VnodeKind::RegularFile).unwrap();
        assert_eq!(fs.write(&file, b"hello", 0).unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(fs.read(&file, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.size(), 5);

        // Fresh inode comes from the first free bit (first_ino = 11)
        assert_eq!(file.inode, 11);
        assert!(names(fs).contains(&String::from("a.txt")));
    }

    #[test]
    fn test_lookup_returns_cached_vnode() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        fs.create(&root, "same.txt", VnodeKind::RegularFile).unwrap();
        let a = fs.find_in_directory(&root, "same.txt").unwrap().unwrap();
        let b = fs.find_in_directory(&root, "same.txt").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_read_at_size_returns_zero() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        let file = fs.create(&root, "eof.txt", VnodeKind::RegularFile).unwrap();
        fs.write(&file, b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&file, &mut buf, 3).unwrap(), 0);
        // Short read when straddling the end
        assert_eq!(fs.read(&file, &mut buf, 1).unwrap(), 2);
    }

    #[test]
    fn test_sparse_write_zero_fills_gap() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        let file = fs.create(&root, "gap.txt", VnodeKind::RegularFile).unwrap();
        fs.write(&file, b"x", 5000).unwrap();
        assert_eq!(file.size(), 5001);

        let mut buf = [0xAAu8; 16];
        assert_eq!(fs.read(&file, &mut buf, 4990).unwrap(), 11);
        assert_eq!(&buf[..10], &[0; 10]);
        assert_eq!(buf[10], b'x');
    }

    #[test]
    fn test_write_read_across_indirection_thresholds() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        let file = fs.create(&root, "deep.txt", VnodeKind::RegularFile).unwrap();

        let n = fs.block_size(); // pointers per block * 4 == block size
        let ptrs = n / 4;
        let offsets = [
            100,                                        // direct
            12 * n + 17,                                // single indirect
            (12 + ptrs) * n + 17,                       // double indirect
            (12 + ptrs + ptrs * ptrs) * n + 17,         // triple indirect
        ];
        for (i, &offset) in offsets.iter().enumerate() {
            let payload = [b'A' + i as u8; 9];
            assert_eq!(fs.write(&file, &payload, offset).unwrap(), 9);
        }
        for (i, &offset) in offsets.iter().enumerate() {
            let mut buf = [0u8; 9];
            assert_eq!(fs.read(&file, &mut buf, offset).unwrap(), 9);
            assert_eq!(buf, [b'A' + i as u8; 9]);
        }

        // A hole between two allocated regions reads as zeroes
        let mut buf = [0xFFu8; 32];
        assert_eq!(fs.read(&file, &mut buf, 40 * n).unwrap(), 32);
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn test_remove_entry_keeps_remaining_listing() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        fs.create(&root, "one", VnodeKind::RegularFile).unwrap();
        fs.create(&root, "two", VnodeKind::RegularFile).unwrap();
        fs.create(&root, "three", VnodeKind::RegularFile).unwrap();

        let before = names(fs);
        fs.remove(&root, "two").unwrap();
        let after = names(fs);

        let expected: Vec<String> =
            before.into_iter().filter(|n| n != "two").collect();
        assert_eq!(after, expected);
        assert!(fs.find_in_directory(&root, "two").unwrap().is_none());
    }

    #[test]
    fn test_truncate_releases_blocks_for_reuse() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        let file = fs.create(&root, "big.txt", VnodeKind::RegularFile).unwrap();

        // Large enough that two live copies would exhaust the image
        let block = vec![7u8; fs.block_size() as usize];
        for i in 0..60 {
            fs.write(&file, &block, i * fs.block_size()).unwrap();
        }
        fs.truncate(&file).unwrap();
        assert_eq!(file.size(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&file, &mut buf, 0).unwrap(), 0);

        // Only possible if truncate returned the blocks to the bitmap
        let other = fs.create(&root, "next.txt", VnodeKind::RegularFile).unwrap();
        for i in 0..60 {
            fs.write(&other, &block, i * fs.block_size()).unwrap();
        }
        let mut byte = [0u8; 1];
        fs.read(&other, &mut byte, 59 * fs.block_size()).unwrap();
        assert_eq!(byte[0], 7);
    }

    #[test]
    fn test_append_fills_directory_block_then_grows() {
        let fs = mount_test_image();
        let root = fs.root_vnode().unwrap();
        // Enough entries to overflow the first directory block
        for i in 0..40 {
            let name = alloc::format!("file-with-a-longer-name-{i:02}");
            fs.create(&root, &name, VnodeKind::RegularFile).unwrap();
        }
        let listing = names(fs);
        assert_eq!(listing.len(), 42);
        for i in 0..40 {
            let name = alloc::format!("file-with-a-longer-name-{i:02}");
            assert!(listing.contains(&name));
            assert!(fs.find_in_directory(&root, &name).unwrap().is_some());
        }
    }
}
