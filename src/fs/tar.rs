/*
 * USTAR TAR Archive Filesystem
 *
 * The boot loader hands the kernel its initial filesystem as an
 * uncompressed USTAR archive. This module mounts such an archive read-only:
 * regular-file entries are indexed once at mount time and served through
 * the Inode trait with positional reads out of the archive slice.
 *
 * USTAR Format:
 * - 512-byte headers for each file
 * - File data padded to 512-byte boundaries
 * - Two null blocks (1024 bytes of zeros) mark end of archive
 *
 * Header format (USTAR):
 * - Offset 0: filename (100 bytes)
 * - Offset 124: file size (12 bytes, octal)
 * - Offset 156: type flag (1 byte)
 * - Offset 257: USTAR indicator "ustar\0" (6 bytes)
 * - Offset 345: filename prefix (155 bytes)
 */

use core::str;

use heapless::Vec;

use crate::fs::{Inode, Vfs};

/// Most entries a mounted archive may carry.
pub const MAX_FILES: usize = 64;

/// TAR header (512 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct TarHeader {
    name: [u8; 100],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    size: [u8; 12],
    mtime: [u8; 12],
    checksum: [u8; 8],
    typeflag: u8,
    linkname: [u8; 100],
    magic: [u8; 6], // "ustar\0"
    version: [u8; 2],
    uname: [u8; 32],
    gname: [u8; 32],
    devmajor: [u8; 8],
    devminor: [u8; 8],
    prefix: [u8; 155],
    _padding: [u8; 12],
}

/// One regular file of a mounted archive.
pub struct TarInode<'a> {
    /// File name (null-terminated)
    name: [u8; 256],
    data: &'a [u8],
}

impl TarInode<'_> {
    /// Get the file name as a string slice
    pub fn name_str(&self) -> Result<&str, &'static str> {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        str::from_utf8(&self.name[..len]).map_err(|_| "Invalid UTF-8 in filename")
    }
}

impl Inode for TarInode<'_> {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, dst: &mut [u8], offset: u64) -> usize {
        if offset >= self.data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = core::cmp::min(dst.len(), self.data.len() - start);
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }
}

/// Read-only filesystem over a USTAR archive slice.
pub struct TarFs<'a> {
    files: Vec<TarInode<'a>, MAX_FILES>,
}

impl<'a> TarFs<'a> {
    /// Mount an archive: walk the headers and index every regular file.
    pub fn mount(archive: &'a [u8]) -> Result<Self, &'static str> {
        let mut files: Vec<TarInode<'a>, MAX_FILES> = Vec::new();
        let mut offset = 0;

        while offset + 512 <= archive.len() {
            // Two zero blocks mark end of archive.
            if offset + 1024 <= archive.len()
                && Self::is_zero_block(&archive[offset..offset + 512])
                && Self::is_zero_block(&archive[offset + 512..offset + 1024])
            {
                break;
            }

            let header_bytes = &archive[offset..offset + 512];
            let header = unsafe { &*(header_bytes.as_ptr() as *const TarHeader) };

            if &header.magic[..5] != b"ustar" {
                // Not a valid USTAR header, skip
                offset += 512;
                continue;
            }

            let size = Self::parse_octal(&header.size)?;
            let data_offset = offset + 512;

            if data_offset + size > archive.len() {
                return Err("File data extends beyond archive");
            }

            // Regular files only; directories and friends are skipped.
            if header.typeflag == b'0' || header.typeflag == 0 {
                let name = Self::get_filename(header)?;
                let inode = TarInode {
                    name,
                    data: &archive[data_offset..data_offset + size],
                };
                files.push(inode).map_err(|_| "Too many files in archive")?;
            }

            // Data is padded to a 512-byte boundary.
            let padded_size = (size + 511) & !511;
            offset = data_offset + padded_size;
        }

        log::info!("tar: mounted archive with {} file(s)", files.len());
        Ok(Self { files })
    }

    /// Number of indexed regular files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Parse an octal number from a TAR header field
    fn parse_octal(field: &[u8]) -> Result<usize, &'static str> {
        let mut result = 0usize;

        for &byte in field {
            if byte == 0 || byte == b' ' {
                break;
            }
            if !byte.is_ascii_digit() || byte > b'7' {
                return Err("Invalid octal digit");
            }
            result = result * 8 + ((byte - b'0') as usize);
        }

        Ok(result)
    }

    /// Get file name from header (joins the USTAR prefix field if set)
    fn get_filename(header: &TarHeader) -> Result<[u8; 256], &'static str> {
        let mut name = [0u8; 256];
        let mut pos = 0;

        if header.prefix[0] != 0 {
            for &byte in &header.prefix {
                if byte == 0 {
                    break;
                }
                if pos >= 256 {
                    return Err("Filename too long");
                }
                name[pos] = byte;
                pos += 1;
            }
            if pos > 0 && name[pos - 1] != b'/' {
                if pos >= 256 {
                    return Err("Filename too long");
                }
                name[pos] = b'/';
                pos += 1;
            }
        }

        for &byte in &header.name {
            if byte == 0 {
                break;
            }
            if pos >= 256 {
                return Err("Filename too long");
            }
            name[pos] = byte;
            pos += 1;
        }

        Ok(name)
    }

    /// Check if a block is all zeros (marks end of archive)
    fn is_zero_block(data: &[u8]) -> bool {
        data.iter().all(|&b| b == 0)
    }
}

impl Vfs for TarFs<'_> {
    fn resolve(&self, path: &str) -> Option<&dyn Inode> {
        self.files
            .iter()
            .find(|f| f.name_str() == Ok(path))
            .map(|f| f as &dyn Inode)
    }
}
