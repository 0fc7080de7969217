//! # Slotted Tuple Pages
//!
//! A tuple page stores variable-length records with a slot directory
//! growing down from the header and record bytes growing up from the page
//! end:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       20    Standard page header (type = tuple)
//! 20      2     remaining_space: bytes still usable
//! 22      2     free_space: offset of the lowest record byte
//! 24      4     slots_in_use
//! 28      4*N   Slot directory (offset u16, size i16), grows down
//! ...           Free region
//! ...     ...   Record bytes, grow up from offset PAGE_SIZE
//! ```
//!
//! A slot whose size is -1 is deleted; the space is not reclaimed and the
//! slot index is never reused, so entries handed out earlier stay stable.
//!
//! Access is gated by the frame latch via the owning [`LatchedPage`]:
//! [`Readable`] over any latch mode, [`Writable`] over an exclusive one.
//! The writer refreshes the header CRC32 when it drops; the reader
//! verifies it when one is present, so torn or corrupted pages surface as
//! [`HeapError::ChecksumMismatch`] instead of garbage records.

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::{LatchedPage, PageId};

use super::{HeapError, HeapResult};

const REMAINING_SPACE_OFFSET: usize = PAGE_HEADER_SIZE;
const FREE_SPACE_OFFSET: usize = PAGE_HEADER_SIZE + 2;
const SLOTS_IN_USE_OFFSET: usize = PAGE_HEADER_SIZE + 4;
const SLOT_DIRECTORY_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const SLOT_SIZE: usize = 4;

/// Stable reference to one record: the owning page and its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entry {
    pub page_id: PageId,
    pub slot: u16,
}

/// Formatting for freshly allocated tuple pages.
pub struct TuplePage;

impl TuplePage {
    /// Initializes the slotted layout on an allocated, exclusively latched
    /// page.
    pub fn format(page: &mut LatchedPage<'_>) {
        let data = page.data_mut();
        write_u16(data, REMAINING_SPACE_OFFSET, (PAGE_SIZE - SLOT_DIRECTORY_OFFSET) as u16);
        write_u16(data, FREE_SPACE_OFFSET, PAGE_SIZE as u16);
        write_u32(data, SLOTS_IN_USE_OFFSET, 0);
        refresh_crc(data);
    }
}

fn read_u16(data: &[u8; PAGE_SIZE], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn write_u16(data: &mut [u8; PAGE_SIZE], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_i16(data: &[u8; PAGE_SIZE], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn write_i16(data: &mut [u8; PAGE_SIZE], offset: usize, value: i16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(data: &[u8; PAGE_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn write_u32(data: &mut [u8; PAGE_SIZE], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn refresh_crc(data: &mut [u8; PAGE_SIZE]) {
    let crc = crate::storage::payload_crc32(data);
    crate::storage::PageHeader::from_page_mut(data).set_crc32(crc);
}

fn slot_entry(data: &[u8; PAGE_SIZE], slot: u16) -> HeapResult<(u16, i16)> {
    let slots = read_u32(data, SLOTS_IN_USE_OFFSET);
    if slot as u32 >= slots {
        return Err(HeapError::RecordDoesntExist(slot));
    }
    let base = SLOT_DIRECTORY_OFFSET + slot as usize * SLOT_SIZE;
    Ok((read_u16(data, base), read_i16(data, base + 2)))
}

fn record_at(data: &[u8; PAGE_SIZE], slot: u16) -> HeapResult<&[u8]> {
    let (offset, size) = slot_entry(data, slot)?;
    if size < 0 {
        return Err(HeapError::RecordDeleted(slot));
    }
    Ok(&data[offset as usize..offset as usize + size as usize])
}

/// Read view over a latched tuple page. Verifies the checksum on
/// construction when the page carries one.
pub struct Readable<'a, 'p> {
    page: &'a LatchedPage<'p>,
}

impl<'a, 'p> Readable<'a, 'p> {
    pub fn new(page: &'a LatchedPage<'p>) -> HeapResult<Self> {
        let data = page.data();
        let stored = crate::storage::PageHeader::from_page(data).crc32();
        if stored != 0 {
            let computed = crate::storage::payload_crc32(data);
            if stored != computed {
                return Err(HeapError::ChecksumMismatch { stored, computed });
            }
        }
        Ok(Self { page })
    }

    /// Bytes of the record in `slot`.
    pub fn get(&self, slot: u16) -> HeapResult<&[u8]> {
        record_at(self.page.data(), slot)
    }

    pub fn slots_in_use(&self) -> u32 {
        read_u32(self.page.data(), SLOTS_IN_USE_OFFSET)
    }

    pub fn remaining_space(&self) -> u16 {
        read_u16(self.page.data(), REMAINING_SPACE_OFFSET)
    }

    /// Iterates live records as `(slot, bytes)`, skipping deleted slots.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> {
        let data = self.page.data();
        let slots = read_u32(data, SLOTS_IN_USE_OFFSET) as u16;
        (0..slots).filter_map(move |slot| match record_at(data, slot) {
            Ok(record) => Some((slot, record)),
            Err(_) => None,
        })
    }
}

/// Write view over an exclusively latched tuple page. Refreshes the page
/// checksum on drop.
pub struct Writable<'a, 'p> {
    page: &'a mut LatchedPage<'p>,
}

impl<'a, 'p> Writable<'a, 'p> {
    pub fn new(page: &'a mut LatchedPage<'p>) -> Self {
        Self { page }
    }

    /// Appends a record, returning its stable entry.
    pub fn put(&mut self, record: &[u8]) -> HeapResult<Entry> {
        let page_id = self.page.page_id();
        let data = self.page.data_mut();

        let needed = record.len() + SLOT_SIZE;
        let remaining = read_u16(data, REMAINING_SPACE_OFFSET) as usize;
        if needed > remaining || record.len() > i16::MAX as usize {
            return Err(HeapError::OutOfSpace {
                needed,
                remaining,
            });
        }

        let slots = read_u32(data, SLOTS_IN_USE_OFFSET);
        let free_space = read_u16(data, FREE_SPACE_OFFSET);
        let offset = free_space - record.len() as u16;
        data[offset as usize..offset as usize + record.len()].copy_from_slice(record);

        let slot_base = SLOT_DIRECTORY_OFFSET + slots as usize * SLOT_SIZE;
        write_u16(data, slot_base, offset);
        write_i16(data, slot_base + 2, record.len() as i16);

        write_u16(data, FREE_SPACE_OFFSET, offset);
        write_u16(data, REMAINING_SPACE_OFFSET, (remaining - needed) as u16);
        write_u32(data, SLOTS_IN_USE_OFFSET, slots + 1);

        Ok(Entry {
            page_id,
            slot: slots as u16,
        })
    }

    /// Marks the record in `slot` deleted. The slot stays; the bytes are
    /// not reclaimed.
    pub fn delete(&mut self, slot: u16) -> HeapResult<()> {
        let data = self.page.data_mut();
        let (_, size) = slot_entry(data, slot)?;
        if size < 0 {
            return Err(HeapError::RecordDeleted(slot));
        }
        let base = SLOT_DIRECTORY_OFFSET + slot as usize * SLOT_SIZE;
        write_i16(data, base + 2, -1);
        Ok(())
    }

    /// Bytes of the record in `slot`.
    pub fn get(&self, slot: u16) -> HeapResult<&[u8]> {
        record_at(self.page.data(), slot)
    }
}

impl Drop for Writable<'_, '_> {
    fn drop(&mut self) {
        refresh_crc(self.page.data_mut());
    }
}
