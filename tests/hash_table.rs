//! End-to-end hash table scenarios: growth through splits and directory
//! doubling, destruction, persistence across reopen, and concurrent reads.

use std::thread;

use eyre::Result;
use tempfile::tempdir;
use tuskdb::{BufferPool, HashTable, PageType, PagedFile};

fn create_pool(dir: &tempfile::TempDir, frames: usize) -> Result<BufferPool> {
    let file = PagedFile::open(dir.path().join("table.tusk"))?;
    Ok(BufferPool::new(file, frames)?)
}

#[test]
fn values_accumulate_per_key() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 16)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    assert!(table.put(&0, &1)?);
    assert!(table.put(&0, &2)?);

    let mut out = Vec::new();
    table.get(&0, &mut out)?;
    out.sort_unstable();
    assert_eq!(out, [1, 2]);

    table.remove(&0, &1)?;
    let mut out = Vec::new();
    table.get(&0, &mut out)?;
    assert_eq!(out, [2]);
    Ok(())
}

#[test]
fn thousand_inserts_survive_splits() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 100)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    // A bucket holds 959 (u16, u16) cells, so 4096 keys overflow the two
    // depth-1 buckets, forcing splits. The first split of a depth-1 bucket
    // already exceeds the global depth and doubles the directory.
    for i in 0..4096u16 {
        assert!(table.put(&i, &i)?);
    }

    for i in 0..4096u16 {
        let mut out = Vec::new();
        table.get(&i, &mut out)?;
        assert_eq!(out, [i], "key {i} lost after splits");
    }

    assert!(
        table.global_depth()? > 1,
        "a 4096-key load must have doubled the directory"
    );
    Ok(())
}

#[test]
fn put_get_holds_across_splits_with_duplicates() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 100)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    // Multimap load: four values per key, enough total cells to split.
    for i in 0..800u16 {
        for v in 0..4u16 {
            table.put(&i, &(i.wrapping_mul(4) + v))?;
        }
    }

    for i in 0..800u16 {
        let mut out = Vec::new();
        table.get(&i, &mut out)?;
        out.sort_unstable();
        let expected: Vec<u16> = (0..4u16).map(|v| i.wrapping_mul(4) + v).collect();
        assert_eq!(out, expected, "values lost for key {i}");
    }
    Ok(())
}

#[test]
fn remove_takes_one_occurrence() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 16)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    for i in 0..100u16 {
        table.put(&i, &i)?;
        table.put(&i, &(i + 1000))?;
    }
    for i in 0..100u16 {
        table.remove(&i, &i)?;
    }

    for i in 0..100u16 {
        let mut out = Vec::new();
        table.get(&i, &mut out)?;
        assert_eq!(out, [i + 1000]);
    }
    Ok(())
}

#[test]
fn destroyed_table_pages_are_reallocated() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 100)?;

    let table = HashTable::<u16, u16>::new(&pool)?;
    let directory_page_id = table.directory_page_id();
    for i in 0..4096u16 {
        table.put(&i, &i)?;
    }
    table.destroy()?;

    // Every bucket and the directory went back to the page directory: the
    // table's lowest id (its directory page) is the first thing a fresh
    // allocation receives.
    let reused = pool.allocate(PageType::Tuple)?;
    assert_eq!(reused.page_id(), directory_page_id);
    Ok(())
}

#[test]
fn clean_shutdown_preserves_the_table() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("persist.tusk");

    let directory_page_id;
    {
        let file = PagedFile::open(&path)?;
        let pool = BufferPool::new(file, 100)?;
        let table = HashTable::<u16, u16>::new(&pool)?;
        directory_page_id = table.directory_page_id();
        for i in 0..4096u16 {
            table.put(&i, &i)?;
        }
        // Pool drop writes back every dirty page.
    }

    let file = PagedFile::open(&path)?;
    let pool = BufferPool::new(file, 100)?;
    let table = HashTable::<u16, u16>::open(&pool, directory_page_id)?;

    for i in 0..4096u16 {
        let mut out = Vec::new();
        table.get(&i, &mut out)?;
        assert_eq!(out, [i], "key {i} lost across reopen");
    }

    // The allocator state survived too: new pages do not collide with the
    // table's pages.
    let fresh = pool.allocate(PageType::Tuple)?;
    let mut out = Vec::new();
    table.get(&7, &mut out)?;
    assert_eq!(out, [7]);
    drop(fresh);
    Ok(())
}

#[test]
fn byte_array_keys() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 16)?;
    let table = HashTable::<[u8; 256], u16>::new(&pool)?;

    let mut key = [0u8; 256];
    key[..5].copy_from_slice(b"hello");
    table.put(&key, &1)?;
    table.put(&key, &2)?;

    let mut out = Vec::new();
    table.get(&key, &mut out)?;
    out.sort_unstable();
    assert_eq!(out, [1, 2]);
    Ok(())
}

#[test]
fn concurrent_readers_see_all_values() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 100)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    for i in 0..512u16 {
        table.put(&i, &i)?;
    }

    thread::scope(|scope| {
        for t in 0..4u16 {
            let table = &table;
            scope.spawn(move || {
                for i in (t..512u16).step_by(4) {
                    let mut out = Vec::new();
                    table.get(&i, &mut out).unwrap();
                    assert_eq!(out, [i]);
                }
            });
        }
    });
    Ok(())
}

#[test]
fn concurrent_writers_do_not_lose_mappings() -> Result<()> {
    let dir = tempdir()?;
    let pool = create_pool(&dir, 100)?;
    let table = HashTable::<u16, u16>::new(&pool)?;

    thread::scope(|scope| {
        for t in 0..4u16 {
            let table = &table;
            scope.spawn(move || {
                for i in 0..512u16 {
                    let key = t * 512 + i;
                    table.put(&key, &key).unwrap();
                }
            });
        }
    });

    for key in 0..2048u16 {
        let mut out = Vec::new();
        table.get(&key, &mut out)?;
        assert_eq!(out, [key], "mapping for {key} lost under concurrency");
    }
    Ok(())
}
