//! Typed errors for the storage layer.
//!
//! Every failure the buffer pool or paged file can surface is a distinct
//! variant so callers can match on the kind. I/O errors pass through
//! unmodified; nothing is retried internally.

use thiserror::Error;

use super::{PageId, PageType};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file was formatted with a different page size.
    #[error("file page size {found} does not match expected {expected}")]
    InvalidPageSize { expected: u32, found: u32 },

    /// Every frame is pinned; the pool is too small for the working set.
    #[error("buffer pool exhausted: every frame is pinned")]
    Full,

    /// A page of one kind was pinned as another.
    #[error("page {page_id} has type {found:?}, expected {expected:?}")]
    PageTypeMismatch {
        page_id: PageId,
        expected: PageType,
        found: PageType,
    },

    /// A formatted page failed validation on load.
    #[error("page {page_id} failed validation: {reason}")]
    Invalid { page_id: PageId, reason: &'static str },

    /// The id being freed is not covered by any directory page.
    #[error("page {0} is not covered by any directory page")]
    PageNotFound(PageId),

    /// The page being freed still has residual pins.
    #[error("page {0} is still pinned and cannot be freed")]
    CannotFree(PageId),
}
