//! # Extendible Hash Table
//!
//! The multimap operations over the on-disk directory and bucket pages.
//!
//! ## Addressing
//!
//! A key hashes with xxHash64 (seed 0). The low `global_depth` bits pick
//! the directory slot; the remaining bits pick where probing starts inside
//! the bucket. Probing walks forward while cells are occupied and stops at
//! the first unoccupied cell, so lookups never scan a whole bucket unless
//! it has filled up at some point.
//!
//! ## Splitting
//!
//! When an insert finds its bucket full, the bucket's local depth goes up
//! by one; if that exceeds the global depth the directory doubles first.
//! Two fresh buckets replace the old one: the directory slots that pointed
//! at it are rewritten in two halves (base and mirror), every readable
//! cell of the old bucket is re-hashed into one of the two, the old page
//! is freed, and the insert retries. Each retry either succeeds or halves
//! the address space of the failing bucket, so the loop terminates.
//!
//! ## Locking
//!
//! A structural RwLock covers the whole table: `put` and `destroy` take it
//! exclusively, `get` and `remove` share it. Bucket pages are additionally
//! latched through the buffer pool (shared for `get`, exclusive for `put`
//! and `remove`), so two removes on different buckets proceed in parallel
//! while a split blocks everything - no bucket latch is ever held while
//! the structural lock is being acquired.

use std::marker::PhantomData;

use hashbrown::HashSet;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;
use xxhash_rust::xxh64::xxh64;
use zerocopy::IntoBytes as _;

use crate::storage::{
    BufferPool, LatchKind, PageHeader, PageId, PageType, StorageError, StorageResult,
};

use super::{BucketLayout, BucketMut, BucketRef, FixedLayout, HashDirectoryPage};

/// A persistent extendible-hash multimap keyed on fixed-layout values.
pub struct HashTable<'p, K, V> {
    pool: &'p BufferPool,
    directory_page_id: PageId,
    latch: RwLock<()>,
    _marker: PhantomData<fn(K, V)>,
}

impl<'p, K: FixedLayout, V: FixedLayout> HashTable<'p, K, V> {
    /// Creates a table: one directory page at global depth 1 over two
    /// fresh buckets.
    pub fn new(pool: &'p BufferPool) -> StorageResult<Self> {
        assert!(
            BucketLayout::<K, V>::CAPACITY >= 2,
            "key/value pair too large for a bucket page"
        );

        let mut directory = pool.alloc_latched(PageType::HashDirectory, LatchKind::Exclusive)?;
        let bucket_even = pool.allocate(PageType::HashBucket)?;
        let bucket_odd = pool.allocate(PageType::HashBucket)?;

        let directory_page_id = directory.page_id();
        HashDirectoryPage::from_page_mut(directory.data_mut())
            .init(bucket_even.page_id(), bucket_odd.page_id());
        debug!(
            directory_page_id,
            bucket_even = bucket_even.page_id(),
            bucket_odd = bucket_odd.page_id(),
            "created hash table"
        );

        Ok(Self {
            pool,
            directory_page_id,
            latch: RwLock::new(()),
            _marker: PhantomData,
        })
    }

    /// Reattaches to a persisted table by its directory page id.
    pub fn open(pool: &'p BufferPool, directory_page_id: PageId) -> StorageResult<Self> {
        let page = pool.pin_latched(
            directory_page_id,
            Some(PageType::HashDirectory),
            LatchKind::Shared,
        )?;
        let header = PageHeader::from_page(page.data());
        if !header.is_formatted() || header.page_type() != Some(PageType::HashDirectory) {
            return Err(StorageError::PageTypeMismatch {
                page_id: directory_page_id,
                expected: PageType::HashDirectory,
                found: header.page_type().unwrap_or(PageType::Free),
            });
        }
        drop(page);

        Ok(Self {
            pool,
            directory_page_id,
            latch: RwLock::new(()),
            _marker: PhantomData,
        })
    }

    /// The page id a caller persists to find this table again.
    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    /// Current global depth: the number of low hash bits the directory
    /// distinguishes.
    pub fn global_depth(&self) -> StorageResult<u32> {
        let _structural = self.latch.read();
        let page = self.pool.pin_latched(
            self.directory_page_id,
            Some(PageType::HashDirectory),
            LatchKind::Shared,
        )?;
        Ok(HashDirectoryPage::from_page(page.data()).global_depth())
    }

    fn hash_key(key: &K) -> u64 {
        xxh64(key.as_bytes(), 0)
    }

    /// Directory slot and bucket for a hash, read under a shared latch.
    fn lookup(&self, hash: u64) -> StorageResult<(u32, PageId)> {
        let page = self.pool.pin_latched(
            self.directory_page_id,
            Some(PageType::HashDirectory),
            LatchKind::Shared,
        )?;
        let directory = HashDirectoryPage::from_page(page.data());
        let slot = directory.slot_of(hash);
        Ok((directory.global_depth(), directory.bucket_page_id(slot)))
    }

    /// Inserts one `(key, value)` mapping. Duplicate keys accumulate;
    /// duplicate pairs are kept as independent mappings.
    pub fn put(&self, key: &K, value: &V) -> StorageResult<bool> {
        let _structural = self.latch.write();
        let hash = Self::hash_key(key);

        loop {
            let (global_depth, bucket_id) = self.lookup(hash)?;
            {
                let mut page = self.pool.pin_latched(
                    bucket_id,
                    Some(PageType::HashBucket),
                    LatchKind::Exclusive,
                )?;
                let mut bucket = BucketMut::<K, V>::new(page.data_mut());
                if bucket.insert(hash, global_depth, key, value) {
                    return Ok(true);
                }
            }
            // Bucket full: split it and retry. Each round either succeeds
            // or halves the address space behind the full bucket.
            self.split(hash)?;
        }
    }

    /// Appends every value stored under `key` to `out`.
    pub fn get(&self, key: &K, out: &mut Vec<V>) -> StorageResult<()> {
        let _structural = self.latch.read();
        let hash = Self::hash_key(key);
        let (global_depth, bucket_id) = self.lookup(hash)?;

        let page =
            self.pool
                .pin_latched(bucket_id, Some(PageType::HashBucket), LatchKind::Shared)?;
        let bucket = BucketRef::<K, V>::new(page.data());

        let capacity = BucketLayout::<K, V>::CAPACITY;
        let start = BucketLayout::<K, V>::probe_start(hash, global_depth);
        for step in 0..capacity {
            let index = (start + step) % capacity;
            if !bucket.occupied(index) {
                break;
            }
            if bucket.readable(index) && bucket.key_matches(index, key) {
                out.push(bucket.value(index));
            }
        }
        Ok(())
    }

    /// Removes mappings matching both `key` and `value`, tombstoning their
    /// cells. Other values under the same key are untouched.
    pub fn remove(&self, key: &K, value: &V) -> StorageResult<()> {
        let _structural = self.latch.read();
        let hash = Self::hash_key(key);
        let (global_depth, bucket_id) = self.lookup(hash)?;

        let mut page = self.pool.pin_latched(
            bucket_id,
            Some(PageType::HashBucket),
            LatchKind::Exclusive,
        )?;
        let mut bucket = BucketMut::<K, V>::new(page.data_mut());

        let capacity = BucketLayout::<K, V>::CAPACITY;
        let start = BucketLayout::<K, V>::probe_start(hash, global_depth);
        for step in 0..capacity {
            let index = (start + step) % capacity;
            let view = bucket.as_ref();
            if !view.occupied(index) {
                break;
            }
            if view.readable(index)
                && view.key_matches(index, key)
                && view.value_matches(index, value)
            {
                // Only readable clears; occupied stays so later cells on
                // this probe chain remain reachable.
                bucket.set_readable(index, false);
            }
        }
        Ok(())
    }

    /// Splits the bucket that the hash currently lands in, doubling the
    /// directory first when the bucket's depth has caught up with it.
    fn split(&self, hash: u64) -> StorageResult<()> {
        let mut directory_page = self.pool.pin_latched(
            self.directory_page_id,
            Some(PageType::HashDirectory),
            LatchKind::Exclusive,
        )?;

        let (global_depth, new_local, old_bucket_id) = {
            let directory = HashDirectoryPage::from_page_mut(directory_page.data_mut());
            let slot = directory.slot_of(hash);
            let new_local = directory.local_depth(slot) + 1;
            if u32::from(new_local) > directory.global_depth() {
                directory.double();
                debug!(
                    global_depth = directory.global_depth(),
                    "doubled hash directory"
                );
            }
            let slot = directory.slot_of(hash);
            (
                directory.global_depth(),
                new_local,
                directory.bucket_page_id(slot),
            )
        };

        let mut replacement = self
            .pool
            .alloc_latched(PageType::HashBucket, LatchKind::Exclusive)?;
        let mut mirror = self
            .pool
            .alloc_latched(PageType::HashBucket, LatchKind::Exclusive)?;

        // Rewrite every directory slot of the old bucket's group: the half
        // whose new bit is clear keeps probing the replacement, the half
        // whose new bit is set moves to the mirror.
        let split_bit = 1usize << (new_local - 1);
        let low_mask = split_bit - 1;
        let low = (hash as usize) & low_mask;
        {
            let directory = HashDirectoryPage::from_page_mut(directory_page.data_mut());
            for slot in 0..directory.size() {
                if slot & low_mask != low {
                    continue;
                }
                let id = if slot & split_bit != 0 {
                    mirror.page_id()
                } else {
                    replacement.page_id()
                };
                directory.set_bucket_page_id(slot, id);
                directory.set_local_depth(slot, new_local);
            }
        }

        // Re-hash the old bucket's readable cells into the two halves.
        let cells: SmallVec<[(K, V); 32]> = {
            let old_page = self.pool.pin_latched(
                old_bucket_id,
                Some(PageType::HashBucket),
                LatchKind::Shared,
            )?;
            let old_bucket = BucketRef::<K, V>::new(old_page.data());
            (0..BucketLayout::<K, V>::CAPACITY)
                .filter(|&index| old_bucket.readable(index))
                .map(|index| (old_bucket.key(index), old_bucket.value(index)))
                .collect()
        };

        let mut replacement_bucket = BucketMut::<K, V>::new(replacement.data_mut());
        let mut mirror_bucket = BucketMut::<K, V>::new(mirror.data_mut());
        for (cell_key, cell_value) in &cells {
            let cell_hash = Self::hash_key(cell_key);
            let inserted = if cell_hash as usize & split_bit != 0 {
                mirror_bucket.insert(cell_hash, global_depth, cell_key, cell_value)
            } else {
                replacement_bucket.insert(cell_hash, global_depth, cell_key, cell_value)
            };
            // Both halves start empty and together hold at most one old
            // bucket's worth of cells.
            assert!(inserted, "bucket split overflowed a fresh bucket");
        }

        debug!(
            old_bucket = old_bucket_id,
            replacement = replacement.page_id(),
            mirror = mirror.page_id(),
            local_depth = new_local,
            "split hash bucket"
        );

        drop(replacement);
        drop(mirror);
        drop(directory_page);
        self.pool.free(old_bucket_id)?;
        Ok(())
    }

    /// Frees every bucket page (each unique id once) and the directory
    /// page, consuming the table.
    pub fn destroy(self) -> StorageResult<()> {
        let _structural = self.latch.write();

        let buckets: HashSet<PageId> = {
            let page = self.pool.pin_latched(
                self.directory_page_id,
                Some(PageType::HashDirectory),
                LatchKind::Shared,
            )?;
            let directory = HashDirectoryPage::from_page(page.data());
            (0..directory.size())
                .map(|slot| directory.bucket_page_id(slot))
                .collect()
        };

        for bucket_id in buckets {
            self.pool.free(bucket_id)?;
        }
        self.pool.free(self.directory_page_id)?;
        debug!(
            directory_page_id = self.directory_page_id,
            "destroyed hash table"
        );
        Ok(())
    }
}
