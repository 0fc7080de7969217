//! # TuskDB Configuration Constants
//!
//! Every on-disk layout constant in one place. The relationships below are
//! load-bearing; compile-time assertions at the bottom of this file enforce
//! them.
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (20 bytes, fixed)
//!       │
//!       ├─> PAGE_USABLE_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │
//!       └─> PAGES_PER_DIRECTORY (derived: bitmap bits per directory page)
//!
//! FILE_HEADER_SIZE (4 bytes)
//!       │
//!       └─> page k lives at byte offset FILE_HEADER_SIZE + k * PAGE_SIZE
//!
//! HASH_DIRECTORY_SLOTS (512)
//!       │
//!       └─> MAX_GLOBAL_DEPTH (9 = log2(512))
//! ```

// ============================================================================
// PAGE LAYOUT
// ============================================================================

/// Size of every on-disk page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of the header at the start of every formatted page:
/// magic(4) + crc32(4) + page_id(4) + lsn(4) + page_type(1) + reserved(3).
pub const PAGE_HEADER_SIZE: usize = 20;

/// Bytes of a page available after the page header.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Sentinel stamped into `magic` when a page is formatted. A page whose
/// header does not carry this value is treated as fresh.
pub const PAGE_MAGIC: u32 = 0xD3AD_B33F;

// ============================================================================
// FILE LAYOUT
// ============================================================================

/// Size of the file header preceding page 0: version(2) + page_size(2).
pub const FILE_HEADER_SIZE: usize = 4;

/// On-disk format version written into the file header.
pub const FORMAT_VERSION: u16 = 1;

// ============================================================================
// PAGE DIRECTORY
// ============================================================================

/// Size of the `next` link following the page header on a directory page.
pub const DIRECTORY_NEXT_SIZE: usize = 4;

/// Number of page ids managed by one directory page. One bit per page,
/// rounded down to a whole number of bitmap bytes.
///
/// The final bit of every directory page is reserved: page id
/// `dir.page_id + PAGES_PER_DIRECTORY` is where the successor directory
/// page is seeded when this one fills, so that id is never handed out.
pub const PAGES_PER_DIRECTORY: usize =
    (PAGE_SIZE - PAGE_HEADER_SIZE - DIRECTORY_NEXT_SIZE) / 8 * 8;

/// Bytes of bitmap actually used on a directory page.
pub const DIRECTORY_BITMAP_BYTES: usize = PAGES_PER_DIRECTORY / 8;

// ============================================================================
// BUFFER POOL
// ============================================================================

/// Default number of frames when the embedder does not choose one.
pub const DEFAULT_POOL_FRAMES: usize = 64;

/// A pool needs the permanently pinned directory head plus at least one
/// working frame.
pub const MIN_POOL_FRAMES: usize = 2;

// ============================================================================
// EXTENDIBLE HASH
// ============================================================================

/// Number of slots in the hash directory page arrays. The directory grows
/// in powers of two up to this bound.
pub const HASH_DIRECTORY_SLOTS: usize = 512;

/// Maximum global depth: log2(HASH_DIRECTORY_SLOTS).
pub const MAX_GLOBAL_DEPTH: u32 = 9;

// ============================================================================
// COMPILE-TIME CHECKS
// ============================================================================

const _: () = assert!(PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE);

const _: () = assert!(
    PAGES_PER_DIRECTORY % 8 == 0,
    "directory bitmap must be a whole number of bytes"
);

const _: () = assert!(
    PAGE_HEADER_SIZE + DIRECTORY_NEXT_SIZE + DIRECTORY_BITMAP_BYTES <= PAGE_SIZE,
    "directory page layout must fit in one page"
);

const _: () = assert!(
    1usize << MAX_GLOBAL_DEPTH == HASH_DIRECTORY_SLOTS,
    "MAX_GLOBAL_DEPTH must be log2(HASH_DIRECTORY_SLOTS)"
);

const _: () = assert!(PAGE_SIZE <= u16::MAX as usize, "tuple page offsets are u16");
