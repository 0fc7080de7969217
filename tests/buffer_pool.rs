//! Cross-layer buffer pool scenarios: page directory growth past one
//! bitmap page, tuple pages cycling through a small pool, and writeback
//! durability.

use eyre::Result;
use tempfile::tempdir;
use tuskdb::config::PAGES_PER_DIRECTORY;
use tuskdb::{
    BufferPool, Entry, LatchKind, PageType, PagedFile, Readable, StorageError, TuplePage, Writable,
};

fn create_pool(dir: &tempfile::TempDir, frames: usize) -> Result<BufferPool> {
    let file = PagedFile::open(dir.path().join("pool.tusk"))?;
    Ok(BufferPool::new(file, frames)?)
}

#[test]
fn directory_grows_a_second_bitmap_page() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 8)?;

    // The head covers ids 1..PAGES_PER_DIRECTORY-1; its final bit is
    // reserved for the successor directory page.
    let mut last = 0;
    for _ in 0..PAGES_PER_DIRECTORY {
        last = pool.allocate(PageType::Tuple)?.page_id();
    }

    // The id at the stride belongs to the second directory page, so data
    // pages skip straight over it.
    assert_eq!(last, PAGES_PER_DIRECTORY as u32 + 1);
    let second = pool.pin(
        PAGES_PER_DIRECTORY as u32,
        Some(PageType::Directory),
    )?;
    assert_eq!(second.page_id(), PAGES_PER_DIRECTORY as u32);
    drop(second);

    // Ids freed in the first bitmap page are still found and reused.
    pool.free(17)?;
    assert_eq!(pool.allocate(PageType::Tuple)?.page_id(), 17);

    // And ids in the second page's range free correctly too.
    pool.free(last)?;
    assert_eq!(pool.allocate(PageType::Tuple)?.page_id(), last);
    Ok(())
}

#[test]
fn tuple_pages_cycle_through_a_tiny_pool() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 3)?;

    // More pages than frames: every access pattern below forces eviction
    // and reload traffic through the two working frames.
    let mut entries: Vec<Entry> = Vec::new();
    for batch in 0..8u32 {
        let mut page = pool.alloc_latched(PageType::Tuple, LatchKind::Exclusive)?;
        TuplePage::format(&mut page);
        let mut writer = Writable::new(&mut page);
        for record in 0..4u32 {
            let payload = [batch as u8, record as u8, 0xCC];
            entries.push(writer.put(&payload)?);
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        let page = pool.pin_latched(entry.page_id, Some(PageType::Tuple), LatchKind::Shared)?;
        let reader = Readable::new(&page)?;
        let record = reader.get(entry.slot)?;
        assert_eq!(record[0], (i / 4) as u8);
        assert_eq!(record[1], (i % 4) as u8);
        assert_eq!(record[2], 0xCC);
    }
    Ok(())
}

#[test]
fn records_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("records.tusk");

    let entry;
    {
        let file = PagedFile::open(&path)?;
        let pool = BufferPool::new(file, 4)?;
        let mut page = pool.alloc_latched(PageType::Tuple, LatchKind::Exclusive)?;
        TuplePage::format(&mut page);
        entry = Writable::new(&mut page).put(b"persistent record")?;
    }

    let file = PagedFile::open(&path)?;
    let pool = BufferPool::new(file, 4)?;
    let page = pool.pin_latched(entry.page_id, Some(PageType::Tuple), LatchKind::Shared)?;
    let reader = Readable::new(&page)?;
    assert_eq!(reader.get(entry.slot)?, b"persistent record");
    Ok(())
}

#[test]
fn pool_saturation_reports_full() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 4)?;

    let _a = pool.pin(1, None)?;
    let _b = pool.pin(2, None)?;
    let _c = pool.pin(3, None)?;

    assert!(matches!(pool.pin(4, None), Err(StorageError::Full)));
    Ok(())
}

#[test]
fn mixed_page_kinds_keep_their_types() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 8)?;

    let tuple = pool.allocate(PageType::Tuple)?.page_id();
    let bucket = pool.allocate(PageType::HashBucket)?.page_id();

    assert!(matches!(
        pool.pin(tuple, Some(PageType::HashBucket)),
        Err(StorageError::PageTypeMismatch { .. })
    ));
    assert!(matches!(
        pool.pin(bucket, Some(PageType::Tuple)),
        Err(StorageError::PageTypeMismatch { .. })
    ));

    // After a free, the id loses its kind and can be pinned as anything.
    pool.free(tuple)?;
    drop(pool.pin(tuple, Some(PageType::HashBucket))?);
    Ok(())
}
