//! # Hash Directory Page Layout
//!
//! The directory page of an extendible hash table, living in the page
//! payload after the standard header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------
//! 20      4     global_depth
//! 24      512   local_depths[512]
//! 536     512   page_loads[512]   (reserved for bucket merging)
//! 1048    2048  bucket_page_ids[512]
//! ```
//!
//! Only the first `2^global_depth` slots are active. Slots whose indices
//! agree on the low `local_depth` bits point at the same bucket page;
//! doubling copies slot `k` to slots `2k` and `2k+1` so that invariant is
//! preserved as the directory grows.

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{HASH_DIRECTORY_SLOTS, MAX_GLOBAL_DEPTH, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE};
use crate::storage::PageId;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct HashDirectoryPage {
    global_depth: U32,
    local_depths: [u8; HASH_DIRECTORY_SLOTS],
    page_loads: [u8; HASH_DIRECTORY_SLOTS],
    bucket_page_ids: [U32; HASH_DIRECTORY_SLOTS],
}

const _: () = assert!(std::mem::size_of::<HashDirectoryPage>() <= PAGE_USABLE_SIZE);

impl HashDirectoryPage {
    const SIZE: usize = std::mem::size_of::<Self>();

    pub(crate) fn from_page(data: &[u8; PAGE_SIZE]) -> &Self {
        // INVARIANT: the struct is Unaligned and fits the page payload, so
        // parsing a SIZE-byte slice cannot fail.
        Self::ref_from_bytes(&data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + Self::SIZE])
            .expect("hash directory layout")
    }

    pub(crate) fn from_page_mut(data: &mut [u8; PAGE_SIZE]) -> &mut Self {
        // INVARIANT: as in from_page.
        Self::mut_from_bytes(&mut data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + Self::SIZE])
            .expect("hash directory layout")
    }

    /// Initializes a fresh directory at depth 1 over two buckets. Assumes
    /// the payload is zeroed (freshly allocated).
    pub(crate) fn init(&mut self, bucket_even: PageId, bucket_odd: PageId) {
        self.global_depth = U32::new(1);
        self.local_depths[0] = 1;
        self.local_depths[1] = 1;
        self.bucket_page_ids[0] = U32::new(bucket_even);
        self.bucket_page_ids[1] = U32::new(bucket_odd);
    }

    pub(crate) fn global_depth(&self) -> u32 {
        self.global_depth.get()
    }

    /// Number of active directory slots.
    pub(crate) fn size(&self) -> usize {
        1usize << self.global_depth.get()
    }

    /// Active slot for a hash value: its low `global_depth` bits.
    pub(crate) fn slot_of(&self, hash: u64) -> usize {
        (hash & ((1u64 << self.global_depth.get()) - 1)) as usize
    }

    pub(crate) fn local_depth(&self, slot: usize) -> u8 {
        self.local_depths[slot]
    }

    pub(crate) fn set_local_depth(&mut self, slot: usize, depth: u8) {
        self.local_depths[slot] = depth;
    }

    pub(crate) fn bucket_page_id(&self, slot: usize) -> PageId {
        self.bucket_page_ids[slot].get()
    }

    pub(crate) fn set_bucket_page_id(&mut self, slot: usize, page_id: PageId) {
        self.bucket_page_ids[slot] = U32::new(page_id);
    }

    /// Reserved per-bucket load counter (future bucket merging).
    pub(crate) fn page_load(&self, slot: usize) -> u8 {
        self.page_loads[slot]
    }

    /// Doubles the directory: slot `k` fans out to `2k` and `2k+1`,
    /// descending so lower slots are not clobbered before they are copied.
    pub(crate) fn double(&mut self) {
        let depth = self.global_depth.get();
        assert!(
            depth < MAX_GLOBAL_DEPTH,
            "hash directory cannot grow past depth {MAX_GLOBAL_DEPTH}"
        );

        let old_size = 1usize << depth;
        for slot in (0..old_size).rev() {
            let id = self.bucket_page_ids[slot];
            let local = self.local_depths[slot];
            let even = slot << 1;
            let odd = (slot << 1) + 1;
            self.bucket_page_ids[even] = id;
            self.bucket_page_ids[odd] = id;
            self.local_depths[even] = local;
            self.local_depths[odd] = local;
        }
        self.global_depth = U32::new(depth + 1);
    }
}
