//! Threaded workloads across the pool and both page consumers: pins and
//! latches from many threads, readers against a writer, and mixed hash
//! traffic.

use std::thread;

use eyre::Result;
use tempfile::tempdir;
use tuskdb::{
    BufferPool, HashTable, LatchKind, PageType, PagedFile, Readable, TuplePage, Writable,
};

fn create_pool(dir: &tempfile::TempDir, frames: usize) -> Result<BufferPool> {
    let file = PagedFile::open(dir.path().join("concurrent.tusk"))?;
    Ok(BufferPool::new(file, frames)?)
}

#[test]
fn parallel_pins_of_disjoint_pages() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 64)?;

    let page_ids: Vec<u32> = (0..32)
        .map(|_| Ok(pool.allocate(PageType::Tuple)?.page_id()))
        .collect::<Result<_>>()?;

    thread::scope(|scope| {
        for chunk in page_ids.chunks(8) {
            let pool = &pool;
            scope.spawn(move || {
                for _ in 0..50 {
                    for &page_id in chunk {
                        let pin = pool.pin(page_id, Some(PageType::Tuple)).unwrap();
                        assert_eq!(pin.page_id(), page_id);
                    }
                }
            });
        }
    });
    Ok(())
}

#[test]
fn shared_readers_and_exclusive_writers_on_one_page() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 8)?;

    let page_id = {
        let mut page = pool.alloc_latched(PageType::Tuple, LatchKind::Exclusive)?;
        TuplePage::format(&mut page);
        Writable::new(&mut page).put(&[0u8; 8])?;
        page.page_id()
    };

    thread::scope(|scope| {
        // One writer keeps rewriting slot 0's bytes to a uniform value.
        let writer_pool = &pool;
        scope.spawn(move || {
            for round in 0..200u8 {
                let mut page = writer_pool
                    .pin_latched(page_id, Some(PageType::Tuple), LatchKind::Exclusive)
                    .unwrap();
                let mut writer = Writable::new(&mut page);
                // Uniform record bytes each round; OutOfSpace once the
                // page fills is fine, the latch traffic is the point.
                let _ = writer.put(&[round; 8]);
            }
        });

        // Readers must always observe uniform record bytes: a torn read
        // would mean the latch let them in mid-write.
        for _ in 0..3 {
            let reader_pool = &pool;
            scope.spawn(move || {
                for _ in 0..200 {
                    let page = reader_pool
                        .pin_latched(page_id, Some(PageType::Tuple), LatchKind::Shared)
                        .unwrap();
                    let reader = Readable::new(&page).unwrap();
                    for (_, record) in reader.iter() {
                        let first = record[0];
                        assert!(record.iter().all(|&b| b == first), "torn record read");
                    }
                }
            });
        }
    });
    Ok(())
}

#[test]
fn hash_reads_interleave_with_removals() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 100)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    for i in 0..1024u16 {
        table.put(&i, &i)?;
        table.put(&i, &(i ^ 0x8000))?;
    }

    thread::scope(|scope| {
        // Removers drop the second value of every key in their stripe.
        for t in 0..2u16 {
            let table = &table;
            scope.spawn(move || {
                for i in (t..1024u16).step_by(2) {
                    table.remove(&i, &(i ^ 0x8000)).unwrap();
                }
            });
        }
        // Readers race them; the first value must never disappear.
        for _ in 0..2 {
            let table = &table;
            scope.spawn(move || {
                for i in 0..1024u16 {
                    let mut out = Vec::new();
                    table.get(&i, &mut out).unwrap();
                    assert!(out.contains(&i), "stable value for {i} vanished");
                    assert!(out.len() <= 2);
                }
            });
        }
    });

    for i in 0..1024u16 {
        let mut out = Vec::new();
        table.get(&i, &mut out)?;
        assert_eq!(out, [i]);
    }
    Ok(())
}
