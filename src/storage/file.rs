//! # Paged File Access
//!
//! The thinnest I/O shim over the backing file: positioned whole-page reads
//! and writes, plus size bookkeeping. No page semantics, no caching.
//!
//! ## File Layout
//!
//! ```text
//! [ FileHeader: version u16 | page_size u16 ][ Page 0 ][ Page 1 ] ...
//! ```
//!
//! Page `k` occupies `PAGE_SIZE` bytes at byte offset
//! `FILE_HEADER_SIZE + k * PAGE_SIZE`. The header is written once when the
//! file is created; on open it is validated and a `page_size` mismatch is
//! rejected with [`StorageError::InvalidPageSize`].
//!
//! Reads past end-of-file zero-extend the file first, so a fresh page
//! always reads back as zeroes and the file grows lazily as high page ids
//! are touched.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, FORMAT_VERSION, PAGE_SIZE};

use super::{PageId, StorageError, StorageResult};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    version: U16,
    page_size: U16,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    fn new() -> Self {
        Self {
            version: U16::new(FORMAT_VERSION),
            page_size: U16::new(PAGE_SIZE as u16),
        }
    }

    pub fn version(&self) -> u16 {
        self.version.get()
    }

    pub fn page_size(&self) -> u16 {
        self.page_size.get()
    }
}

/// Positioned page I/O over one backing file.
#[derive(Debug)]
pub struct PagedFile {
    file: File,
    len: u64,
}

impl PagedFile {
    /// Creates or opens the backing file, writing the file header on
    /// create and validating it on open.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();

        if len == 0 {
            let header = FileHeader::new();
            file.write_all_at(header.as_bytes(), 0)?;
            return Ok(Self {
                file,
                len: FILE_HEADER_SIZE as u64,
            });
        }

        let mut raw = [0u8; FILE_HEADER_SIZE];
        file.read_exact_at(&mut raw, 0)?;
        // INVARIANT: FileHeader is Unaligned and exactly FILE_HEADER_SIZE
        // bytes, so parsing cannot fail.
        let header = FileHeader::ref_from_bytes(&raw).expect("file header layout");

        if header.version() != FORMAT_VERSION {
            return Err(StorageError::Invalid {
                page_id: 0,
                reason: "unsupported file format version",
            });
        }
        if header.page_size() as usize != PAGE_SIZE {
            return Err(StorageError::InvalidPageSize {
                expected: PAGE_SIZE as u32,
                found: header.page_size() as u32,
            });
        }

        Ok(Self { file, len })
    }

    fn page_offset(page_id: PageId) -> u64 {
        FILE_HEADER_SIZE as u64 + page_id as u64 * PAGE_SIZE as u64
    }

    /// Reads exactly one page, zero-extending the file if the page lies
    /// past the current end.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let end = offset + PAGE_SIZE as u64;

        if self.len < end {
            self.extend(end)?;
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes exactly one page, extending the file first when needed.
    pub fn write_page(&mut self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let end = offset + PAGE_SIZE as u64;

        if self.len < end {
            self.extend(end)?;
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Current file length in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Number of whole pages the file currently covers.
    pub fn page_count(&self) -> u32 {
        (self.len.saturating_sub(FILE_HEADER_SIZE as u64) / PAGE_SIZE as u64) as u32
    }

    /// Grows the file to `new_len` bytes (zero-filled). Shrinking is not
    /// supported; a smaller length is a no-op.
    pub fn extend(&mut self, new_len: u64) -> StorageResult<()> {
        if new_len > self.len {
            self.file.set_len(new_len)?;
            self.len = new_len;
        }
        Ok(())
    }

    /// Flushes OS buffers for the file's data.
    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
