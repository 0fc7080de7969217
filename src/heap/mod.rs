//! # Heap Module
//!
//! Slotted tuple pages: variable-length records on a single page, addressed
//! by `(page_id, slot)` entries, with per-slot deletion and an optional
//! payload checksum. Access goes through `Readable`/`Writable` views over a
//! latched buffer-pool page.

mod error;
mod tuple;

pub use error::{HeapError, HeapResult};
pub use tuple::{Entry, Readable, TuplePage, Writable};
