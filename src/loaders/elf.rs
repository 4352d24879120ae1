/*
 * ELF Binary Loader
 *
 * Loads an ELF64 (Executable and Linkable Format) executable from an inode
 * into a user address space.
 *
 * Loading Process:
 * ================
 *
 * 1. Resolve the path and read the ELF header through the inode
 * 2. Validate magic, class, encoding, version, type, machine
 * 3. For each PT_LOAD program header:
 *    - sanity-check the segment (memsz >= filesz, no address wrap,
 *      page-aligned vaddr)
 *    - the first segment anchors the code region
 *    - back [vaddr, vaddr + memsz) with fresh zeroed frames, writable
 *      iff the segment carries PF_W
 *    - copy filesz bytes from the file; the memsz - filesz tail stays
 *      zero (bss)
 * 4. Size the code region to cover all segments (gaps stay unmapped)
 * 5. Anchor the empty heap one guard page above the code end
 *
 * The caller owns the sync: nothing here touches the hardware table.
 * On failure the inode borrow ends and partially built region state is
 * reclaimed by the address space's teardown.
 *
 * References:
 * - ELF64 Specification: https://refspecs.linuxfoundation.org/elf/elf.pdf
 */

use heapless::Vec;

use crate::fs::Vfs;
use crate::memory::address_space::{AddressSpace, MapError, RegionKind};
use crate::memory::layout::{HEAP_GUARD_GAP, USER_SPACE_END};
use crate::memory::phys::FrameAllocator;
use crate::memory::types::{PAGE_SIZE, VirtAddr, is_page_aligned, page_round_down, page_round_up};

/// ELF magic number (0x7F 'E' 'L' 'F')
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class (64-bit)
const ELFCLASS64: u8 = 2;

/// ELF data encoding (little-endian)
const ELFDATA2LSB: u8 = 1;

/// ELF version (current)
const EV_CURRENT: u8 = 1;

/// ELF type: Executable file
const ET_EXEC: u16 = 2;

/// ELF machine: AMD x86-64
const EM_X86_64: u16 = 62;

/// Program header type: Loadable segment
const PT_LOAD: u32 = 1;

/// Program header flag: writable segment
const PF_W: u32 = 2;

/// Most PT_LOAD segments a binary may carry.
pub const MAX_SEGMENTS: usize = 16;

/// ELF64 Header (64 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF64 Program Header (56 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// A loaded ELF segment
#[derive(Debug, Clone, Copy)]
pub struct ElfSegment {
    /// Virtual address where the segment is loaded
    pub vaddr: VirtAddr,
    /// Size of the segment in memory
    pub size: u64,
    /// Whether the segment is writable
    pub writable: bool,
}

/// Loaded ELF binary metadata
#[derive(Debug)]
pub struct ElfBinary {
    /// Entry point (initial RIP)
    pub entry: VirtAddr,
    /// Loaded segments
    pub segments: Vec<ElfSegment, MAX_SEGMENTS>,
}

/// ELF loading errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfLoadError {
    NotFound,
    InvalidMagic,
    InvalidClass,
    InvalidEncoding,
    InvalidVersion,
    InvalidType,
    InvalidMachine,
    InvalidHeader,
    NoLoadableSegments,
    InvalidSegmentBounds,
    UnalignedSegment,
    TooManySegments,
    ShortRead,
    MemoryAllocationFailed,
}

impl core::fmt::Display for ElfLoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ElfLoadError::NotFound => write!(f, "No such file"),
            ElfLoadError::InvalidMagic => write!(f, "Invalid ELF magic number"),
            ElfLoadError::InvalidClass => write!(f, "Not a 64-bit ELF"),
            ElfLoadError::InvalidEncoding => write!(f, "Not little-endian"),
            ElfLoadError::InvalidVersion => write!(f, "Invalid ELF version"),
            ElfLoadError::InvalidType => write!(f, "Not an executable"),
            ElfLoadError::InvalidMachine => write!(f, "Not an x86-64 binary"),
            ElfLoadError::InvalidHeader => write!(f, "Invalid ELF header"),
            ElfLoadError::NoLoadableSegments => write!(f, "No PT_LOAD segments"),
            ElfLoadError::InvalidSegmentBounds => write!(f, "Invalid segment bounds"),
            ElfLoadError::UnalignedSegment => write!(f, "Segment not page-aligned"),
            ElfLoadError::TooManySegments => write!(f, "Too many segments"),
            ElfLoadError::ShortRead => write!(f, "Short read from file"),
            ElfLoadError::MemoryAllocationFailed => write!(f, "Failed to allocate memory"),
        }
    }
}

impl From<MapError> for ElfLoadError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfFrames => ElfLoadError::MemoryAllocationFailed,
            MapError::ShortRead => ElfLoadError::ShortRead,
            MapError::AddressTooHigh => ElfLoadError::InvalidSegmentBounds,
            MapError::NotMapped | MapError::NotWritable => ElfLoadError::InvalidHeader,
        }
    }
}

/// Parse and validate the ELF header.
///
/// Verifies the magic number, 64-bit class, little-endian encoding,
/// current version, executable type and x86-64 architecture.
fn parse_elf_header(data: &[u8; core::mem::size_of::<Elf64Header>()]) -> Result<Elf64Header, ElfLoadError> {
    // Parse header (careful with packed struct alignment)
    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

    if header.e_ident[0..4] != ELF_MAGIC {
        log::error!("ELF: invalid magic: {:?}", &header.e_ident[0..4]);
        return Err(ElfLoadError::InvalidMagic);
    }

    if header.e_ident[4] != ELFCLASS64 {
        log::error!("ELF: not 64-bit (class = {})", header.e_ident[4]);
        return Err(ElfLoadError::InvalidClass);
    }

    if header.e_ident[5] != ELFDATA2LSB {
        log::error!("ELF: not little-endian (encoding = {})", header.e_ident[5]);
        return Err(ElfLoadError::InvalidEncoding);
    }

    if header.e_ident[6] != EV_CURRENT {
        log::error!("ELF: invalid version ({})", header.e_ident[6]);
        return Err(ElfLoadError::InvalidVersion);
    }

    // Read multi-byte fields with read_unaligned (packed struct safety)
    let e_type = unsafe { core::ptr::addr_of!(header.e_type).read_unaligned() };
    let e_machine = unsafe { core::ptr::addr_of!(header.e_machine).read_unaligned() };

    if e_type != ET_EXEC {
        log::error!("ELF: not executable (type = {})", e_type);
        return Err(ElfLoadError::InvalidType);
    }

    if e_machine != EM_X86_64 {
        log::error!("ELF: not x86-64 (machine = {})", e_machine);
        return Err(ElfLoadError::InvalidMachine);
    }

    Ok(header)
}

/// Load the ELF executable at `path` into `space`'s code region and anchor
/// the (empty) heap above it.
///
/// Returns the entry point and per-segment metadata. The hardware table is
/// not touched; the caller syncs when the space is fully assembled.
pub fn load(
    space: &mut AddressSpace,
    falloc: &dyn FrameAllocator,
    fs: &dyn Vfs,
    path: &str,
) -> Result<ElfBinary, ElfLoadError> {
    let inode = fs.resolve(path).ok_or(ElfLoadError::NotFound)?;

    let mut header_buf = [0u8; core::mem::size_of::<Elf64Header>()];
    if inode.read(&mut header_buf, 0) != header_buf.len() {
        return Err(ElfLoadError::ShortRead);
    }
    let header = parse_elf_header(&header_buf)?;

    let e_entry = unsafe { core::ptr::addr_of!(header.e_entry).read_unaligned() };
    let ph_offset = unsafe { core::ptr::addr_of!(header.e_phoff).read_unaligned() };
    let ph_size = unsafe { core::ptr::addr_of!(header.e_phentsize).read_unaligned() } as u64;
    let ph_count = unsafe { core::ptr::addr_of!(header.e_phnum).read_unaligned() } as u64;

    if (ph_size as usize) < core::mem::size_of::<Elf64ProgramHeader>() {
        return Err(ElfLoadError::InvalidHeader);
    }

    log::info!(
        "ELF: loading '{}' ({} program header(s), entry {:#x})",
        path,
        ph_count,
        e_entry
    );

    let mut segments: Vec<ElfSegment, MAX_SEGMENTS> = Vec::new();
    let mut code_base = None;
    let mut code_end = 0u64;

    let code = space.region_mut(RegionKind::Code);
    for i in 0..ph_count {
        let mut ph_buf = [0u8; core::mem::size_of::<Elf64ProgramHeader>()];
        if inode.read(&mut ph_buf, ph_offset + i * ph_size) != ph_buf.len() {
            return Err(ElfLoadError::ShortRead);
        }
        let ph = unsafe { core::ptr::read_unaligned(ph_buf.as_ptr() as *const Elf64ProgramHeader) };

        let p_type = unsafe { core::ptr::addr_of!(ph.p_type).read_unaligned() };
        if p_type != PT_LOAD {
            log::debug!("ELF: segment {}: type = {}, skipping", i, p_type);
            continue;
        }

        let p_vaddr = unsafe { core::ptr::addr_of!(ph.p_vaddr).read_unaligned() };
        let p_filesz = unsafe { core::ptr::addr_of!(ph.p_filesz).read_unaligned() };
        let p_memsz = unsafe { core::ptr::addr_of!(ph.p_memsz).read_unaligned() };
        let p_offset = unsafe { core::ptr::addr_of!(ph.p_offset).read_unaligned() };
        let p_flags = unsafe { core::ptr::addr_of!(ph.p_flags).read_unaligned() };

        log::info!(
            "ELF: segment {}: vaddr={:#x}, filesz={:#x}, memsz={:#x}, flags={:#x}",
            i,
            p_vaddr,
            p_filesz,
            p_memsz,
            p_flags
        );

        if p_memsz < p_filesz {
            return Err(ElfLoadError::InvalidSegmentBounds);
        }
        let end = p_vaddr
            .checked_add(p_memsz)
            .ok_or(ElfLoadError::InvalidSegmentBounds)?;
        // The segment must leave room below the canonical hole for the
        // heap guard gap and anchor.
        if end > USER_SPACE_END - 2 * PAGE_SIZE {
            return Err(ElfLoadError::InvalidSegmentBounds);
        }
        if !is_page_aligned(p_vaddr) {
            return Err(ElfLoadError::UnalignedSegment);
        }

        // The first loadable segment anchors the code region.
        if code_base.is_none() {
            let base = page_round_down(p_vaddr);
            code.set_base(VirtAddr::new(base));
            code_base = Some(base);
        }

        let writable = p_flags & PF_W != 0;
        code.add_mapping(falloc, VirtAddr::new(p_vaddr), p_memsz, true, writable)?;
        code.load_from_inode(falloc, VirtAddr::new(p_vaddr), inode, p_offset, p_filesz)?;

        code_end = core::cmp::max(code_end, end);
        segments
            .push(ElfSegment {
                vaddr: VirtAddr::new(p_vaddr),
                size: p_memsz,
                writable,
            })
            .map_err(|_| ElfLoadError::TooManySegments)?;
    }

    let Some(base) = code_base else {
        log::error!("ELF: no loadable segments in '{}'", path);
        return Err(ElfLoadError::NoLoadableSegments);
    };
    code.set_size(code_end - base);

    // One unmapped guard page between code end and the (empty) heap.
    let heap = space.region_mut(RegionKind::Heap);
    heap.set_base(VirtAddr::new(page_round_up(code_end) + HEAP_GUARD_GAP));
    heap.set_size(0);

    log::info!(
        "ELF: loaded '{}': code [{:#x}, {:#x}), heap base {:#x}",
        path,
        base,
        code_end,
        page_round_up(code_end) + HEAP_GUARD_GAP
    );

    Ok(ElfBinary {
        entry: VirtAddr::new(e_entry),
        segments,
    })
}
