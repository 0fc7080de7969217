//! Typed errors for tuple-page operations.

use thiserror::Error;

use crate::storage::StorageError;

pub type HeapResult<T> = Result<T, HeapError>;

#[derive(Debug, Error)]
pub enum HeapError {
    /// The record plus its slot does not fit in the page's free region.
    #[error("record of {needed} bytes does not fit ({remaining} bytes remaining)")]
    OutOfSpace { needed: usize, remaining: usize },

    /// The slot exists but its record was deleted.
    #[error("record in slot {0} was deleted")]
    RecordDeleted(u16),

    /// The slot index is past the end of the slot directory.
    #[error("slot {0} does not exist")]
    RecordDoesntExist(u16),

    /// The page payload does not match its stored checksum.
    #[error("page checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
