//! ELF64 program loader
//!
//! Materializes a user address space from an executable on the VFS:
//! parses the header and program-header table straight from byte slices,
//! maps `PT_LOAD` segments page by page, chains into the `PT_INTERP`
//! dynamic linker when present, and lays out the System V initial stack
//! (argc/argv/envp/auxv) for dynamically linked executables.
//!
//! Shared objects are loaded at a fixed bias so the interpreter never
//! collides with the executable's own segments.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::arch::PageFlags;
use crate::error::{KernelError, KernelResult};
use crate::fs::vnode::Vnode;
use crate::fs::{self, MountTable};
use crate::mm::{page_base, pages_for, AddressSpace, PAGE_SIZE};

/// ELF magic
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// 64-bit class
const ELFCLASS64: u8 = 2;
/// Little-endian data
const ELFDATA2LSB: u8 = 1;

/// Executable object
const ET_EXEC: u16 = 2;
/// Shared object (the dynamic linker)
const ET_DYN: u16 = 3;

/// Loadable segment
const PT_LOAD: u32 = 1;
/// Interpreter path
const PT_INTERP: u32 = 3;
/// Program header table location
const PT_PHDR: u32 = 6;

/// Size of one ELF64 program header entry
const PHENT_SIZE: u16 = 56;

/// Load bias for shared objects (the dynamic linker)
pub const RTDL_ADDR: u64 = 0x4000_0000;

/// Top of the user stack; the stack grows down from here
pub const USER_STACK_BASE: u64 = 0x7FFF_FFFF_F000;
/// User stack size in bytes
pub const USER_STACK_SIZE: u64 = 0x2000;

/// Interpreter chains deeper than this indicate a cycle
const MAX_INTERP_DEPTH: u32 = 4;

// Auxiliary vector keys (System V x86_64)
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_ENTRY: u64 = 9;

/// Result of loading a program: where to start and the initial user rsp
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: u64,
    pub stack_ptr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElfKind {
    Executable,
    Shared,
}

struct ElfHeader {
    kind: ElfKind,
    entry: u64,
    phoff: u64,
    phnum: u16,
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

impl ElfHeader {
    fn parse(raw: &[u8]) -> KernelResult<Self> {
        if raw.len() < 64 || raw[0..4] != ELF_MAGIC {
            return Err(KernelError::InvalidFormat);
        }
        if raw[4] != ELFCLASS64 || raw[5] != ELFDATA2LSB {
            return Err(KernelError::InvalidFormat);
        }
        let kind = match read_u16(raw, 16) {
            ET_EXEC => ElfKind::Executable,
            ET_DYN => ElfKind::Shared,
            _ => return Err(KernelError::InvalidFormat),
        };
        if read_u16(raw, 54) != PHENT_SIZE {
            return Err(KernelError::InvalidFormat);
        }
        Ok(Self {
            kind,
            entry: read_u64(raw, 24),
            phoff: read_u64(raw, 32),
            phnum: read_u16(raw, 56),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    offset: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
}

impl ProgramHeader {
    fn parse(raw: &[u8]) -> Self {
        Self {
            p_type: read_u32(raw, 0),
            offset: read_u64(raw, 8),
            vaddr: read_u64(raw, 16),
            file_size: read_u64(raw, 32),
            mem_size: read_u64(raw, 40),
        }
    }
}

fn read_exact(vnode: &Arc<Vnode>, buf: &mut [u8], offset: u64) -> KernelResult<()> {
    if vnode.fs.read(vnode, buf, offset)? != buf.len() {
        return Err(KernelError::InvalidFormat);
    }
    Ok(())
}

/// What one loaded object contributes to the final image
struct LoadedObject {
    kind: ElfKind,
    entry: u64,
    phdr_addr: u64,
    phnum: u16,
    interp_entry: Option<u64>,
}

/// Map one `PT_LOAD` segment, zeroing memory beyond the file image
fn load_segment<A: AddressSpace>(
    space: &mut A,
    vnode: &Arc<Vnode>,
    header: &ProgramHeader,
    bias: u64,
) -> KernelResult<()> {
    if header.mem_size == 0 {
        return Ok(());
    }
    let base = bias + header.vaddr;
    let first_page = page_base(base);
    let page_count = pages_for(base + header.mem_size - first_page);

    for page in 0..page_count {
        let page_va = first_page + page * PAGE_SIZE;
        let window = space.map_user_page(page_va, PageFlags::WRITE | PageFlags::USER)?;
        let window = unsafe { core::slice::from_raw_parts_mut(window, PAGE_SIZE as usize) };
        window.fill(0);

        // Portion of [base, base + file_size) falling inside this page
        let file_begin = base.max(page_va);
        let file_end = (base + header.file_size).min(page_va + PAGE_SIZE);
        if file_begin < file_end {
            let in_page = (file_begin - page_va) as usize;
            let span = (file_end - file_begin) as usize;
            read_exact(
                vnode,
                &mut window[in_page..in_page + span],
                header.offset + (file_begin - base),
            )?;
        }
    }
    Ok(())
}

fn load_object<A: AddressSpace>(
    table: &MountTable,
    path: &str,
    space: &mut A,
    depth: u32,
) -> KernelResult<LoadedObject> {
    if depth >= MAX_INTERP_DEPTH {
        return Err(KernelError::InvalidFormat);
    }
    let vnode = fs::path::resolve(table, path)?.existing()?;

    let mut header_raw = [0u8; 64];
    read_exact(&vnode, &mut header_raw, 0)?;
    let header = ElfHeader::parse(&header_raw)?;

    let mut table_raw = vec![0u8; header.phnum as usize * PHENT_SIZE as usize];
    read_exact(&vnode, &mut table_raw, header.phoff)?;

    let bias = match header.kind {
        ElfKind::Executable => 0,
        ElfKind::Shared => RTDL_ADDR,
    };

    let mut phdr_addr = 0;
    let mut interp_entry = None;

    for i in 0..header.phnum as usize {
        let ph = ProgramHeader::parse(&table_raw[i * PHENT_SIZE as usize..]);
        match ph.p_type {
            PT_LOAD => load_segment(space, &vnode, &ph, bias)?,
            PT_PHDR => phdr_addr = ph.vaddr,
            PT_INTERP => {
                let mut path_raw = vec![0u8; ph.file_size as usize];
                read_exact(&vnode, &mut path_raw, ph.offset)?;
                while path_raw.last() == Some(&0) {
                    path_raw.pop();
                }
                let interp_path =
                    String::from_utf8(path_raw).map_err(|_| KernelError::InvalidFormat)?;
                let interp = load_object(table, &interp_path, space, depth + 1)?;
                if interp.kind != ElfKind::Shared {
                    return Err(KernelError::InvalidFormat);
                }
                interp_entry = Some(RTDL_ADDR + interp.entry);
            }
            _ => {}
        }
    }

    Ok(LoadedObject {
        kind: header.kind,
        entry: header.entry,
        phdr_addr,
        phnum: header.phnum,
        interp_entry,
    })
}

/// Map the fixed user stack and, for dynamically linked programs, write
/// the initial argc/argv/envp/auxv frame into its top
fn build_stack<A: AddressSpace>(
    space: &mut A,
    object: &LoadedObject,
) -> KernelResult<u64> {
    let lowest = USER_STACK_BASE - USER_STACK_SIZE;
    let mut top_window = core::ptr::null_mut();
    for page in 0..USER_STACK_SIZE / PAGE_SIZE {
        top_window = space.map_user_page(
            lowest + page * PAGE_SIZE,
            PageFlags::WRITE | PageFlags::USER | PageFlags::NO_EXECUTE,
        )?;
    }

    if object.interp_entry.is_none() {
        return Ok(USER_STACK_BASE);
    }

    // Bottom-up: argc, argv terminator, envp terminator, auxv pairs
    let frame: [u64; 13] = [
        0, // argc
        0, // argv NULL
        0, // envp NULL
        AT_ENTRY,
        object.entry,
        AT_PHNUM,
        object.phnum as u64,
        AT_PHENT,
        PHENT_SIZE as u64,
        AT_PHDR,
        object.phdr_addr,
        AT_NULL,
        0,
    ];
    let frame_bytes = core::mem::size_of_val(&frame);
    let in_page = PAGE_SIZE as usize - frame_bytes;
    unsafe {
        let top_page = core::slice::from_raw_parts_mut(top_window, PAGE_SIZE as usize);
        for (i, value) in frame.iter().enumerate() {
            top_page[in_page + i * 8..in_page + i * 8 + 8]
                .copy_from_slice(&value.to_le_bytes());
        }
    }
    Ok(USER_STACK_BASE - frame_bytes as u64)
}

/// Load the executable at `path` into `space`
///
/// Returns the first instruction to execute (the interpreter's entry for
/// dynamically linked programs) and the initial user stack pointer.
pub fn load_program<A: AddressSpace>(
    table: &MountTable,
    path: &str,
    space: &mut A,
) -> KernelResult<LoadedImage> {
    let object = load_object(table, path, space, 0)?;
    match object.kind {
        ElfKind::Shared => Ok(LoadedImage {
            entry: RTDL_ADDR + object.entry,
            stack_ptr: USER_STACK_BASE,
        }),
        ElfKind::Executable => {
            let stack_ptr = build_stack(space, &object)?;
            Ok(LoadedImage {
                entry: object.interp_entry.unwrap_or(object.entry),
                stack_ptr,
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::testing::{build_elf, Segment};
    use super::*;
    use crate::fs::vnode::testing::TreeFs;
    use crate::fs::{FileSystem, OpenFlags, VnodeKind};
    use crate::mm::testing::MockSpace;

    /// Mount a TreeFs holding the given files as a root filesystem
    fn fs_with_files(files: &[(&str, Vec<u8>)]) -> MountTable {
        let mut spec = Vec::new();
        for (i, (name, _)) in files.iter().enumerate() {
            spec.push((1u64, *name, 2 + i as u64, VnodeKind::RegularFile));
        }
        let fs = TreeFs::build(&spec);
        let mut table = MountTable::new();
        table.set_root(fs.root());

        // Store contents through the descriptor layer
        let mut fds = crate::fs::FdTable::new();
        for (name, data) in files {
            let path = alloc::format!("/{name}");
            let fd = fds.open(&table, &path, OpenFlags::empty()).unwrap();
            let vnode = fds.vnode(fd).unwrap();
            vnode.fs.write(&vnode, data, 0).unwrap();
            fds.close(fd).unwrap();
        }
        table
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut image = build_elf(true, 0x1000, &[], None, None);
        image[0] = 0;
        let table = fs_with_files(&[("bad", image)]);
        let mut space = MockSpace::new().unwrap();
        assert_eq!(
            load_program(&table, "/bad", &mut space).map(|_| ()),
            Err(KernelError::InvalidFormat)
        );
    }

    #[test]
    fn test_static_executable_lands_at_entry() {
        let image = build_elf(
            true,
            0x40_0000,
            &[Segment {
                vaddr: 0x40_0000,
                data: b"CODE".to_vec(),
                mem_size: 0x1800, // spills into a zeroed second page
            }],
            None,
            None,
        );
        let table = fs_with_files(&[("init", image)]);
        let mut space = MockSpace::new().unwrap();

        let loaded = load_program(&table, "/init", &mut space).unwrap();
        assert_eq!(loaded.entry, 0x40_0000);
        // Static binaries get no auxv frame; rsp starts at the stack top
        assert_eq!(loaded.stack_ptr, USER_STACK_BASE);

        assert_eq!(space.read_bytes(0x40_0000, 4), b"CODE");
        // Memory past the file image is zero (bss)
        assert_eq!(space.read_bytes(0x40_0004, 8), alloc::vec![0u8; 8]);
        assert!(space.page(0x40_1000).is_some());
        // Stack pages are mapped
        assert!(space.page(USER_STACK_BASE - 1).is_some());
        assert!(space.page(USER_STACK_BASE - USER_STACK_SIZE).is_some());
    }

    #[test]
    fn test_unaligned_segment_keeps_in_page_offset() {
        let image = build_elf(
            true,
            0x40_0123,
            &[Segment {
                vaddr: 0x40_0123,
                data: b"XYZ".to_vec(),
                mem_size: 3,
            }],
            None,
            None,
        );
        let table = fs_with_files(&[("odd", image)]);
        let mut space = MockSpace::new().unwrap();
        load_program(&table, "/odd", &mut space).unwrap();
        assert_eq!(space.read_bytes(0x40_0123, 3), b"XYZ");
        assert_eq!(space.page(0x40_0000).unwrap()[0], 0);
    }

    #[test]
    fn test_interpreter_chain_and_auxv() {
        let linker = build_elf(
            false,
            0x30, // entry relative to the shared object
            &[Segment {
                vaddr: 0,
                data: b"LINKER".to_vec(),
                mem_size: 6,
            }],
            None,
            None,
        );
        let program = build_elf(
            true,
            0x40_0000,
            &[Segment {
                vaddr: 0x40_0000,
                data: b"MAIN".to_vec(),
                mem_size: 4,
            }],
            Some("/ld.so"),
            Some(0x40_0040),
        );
        let table = fs_with_files(&[("init", program), ("ld.so", linker)]);
        let mut space = MockSpace::new().unwrap();

        let loaded = load_program(&table, "/init", &mut space).unwrap();
        // First instruction is the biased interpreter entry
        assert_eq!(loaded.entry, RTDL_ADDR + 0x30);
        // The interpreter was mapped at the bias
        assert_eq!(space.read_bytes(RTDL_ADDR, 6), b"LINKER");
        assert_eq!(space.read_bytes(0x40_0000, 4), b"MAIN");

        // Initial stack: argc, argv NULL, envp NULL, then the auxv
        let frame = space.read_bytes(loaded.stack_ptr, 13 * 8);
        let word = |i: usize| u64::from_le_bytes(frame[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(loaded.stack_ptr, USER_STACK_BASE - 13 * 8);
        assert_eq!(word(0), 0); // argc
        assert_eq!(word(1), 0); // argv terminator
        assert_eq!(word(2), 0); // envp terminator
        assert_eq!((word(3), word(4)), (AT_ENTRY, 0x40_0000));
        assert_eq!((word(5), word(6)), (AT_PHNUM, 3));
        assert_eq!((word(7), word(8)), (AT_PHENT, 56));
        assert_eq!((word(9), word(10)), (AT_PHDR, 0x40_0040));
        assert_eq!((word(11), word(12)), (AT_NULL, 0));
    }

    #[test]
    fn test_interpreter_cycle_is_rejected() {
        // Interpreter that names itself; must be ET_DYN to recurse
        let looping = build_elf(false, 0, &[], Some("/loop"), None);
        let table = fs_with_files(&[("loop", looping)]);
        let mut space = MockSpace::new().unwrap();
        assert_eq!(
            load_program(&table, "/loop", &mut space).map(|_| ()),
            Err(KernelError::InvalidFormat)
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let table = fs_with_files(&[]);
        let mut space = MockSpace::new().unwrap();
        assert_eq!(
            load_program(&table, "/absent", &mut space).map(|_| ()),
            Err(KernelError::NotFound)
        );
    }
}
