//! Frame slots owned by the buffer pool.
//!
//! A frame is a page-aligned 4KB buffer plus the per-frame state that is
//! touched without the pool lock: the pin count, the dirty flag, and the
//! frame latch. Which page the frame holds, and whether it holds one at
//! all, is tracked in the pool's frame table under the pool lock; a frame
//! is not tied to a specific disk page until loaded.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::PAGE_SIZE;

use super::Latch;

/// A page-sized buffer aligned to the page size, as positioned I/O wants.
#[repr(align(4096))]
pub(crate) struct PageBuf(pub [u8; PAGE_SIZE]);

const _: () = assert!(std::mem::align_of::<PageBuf>() == PAGE_SIZE);

pub(crate) struct Frame {
    data: UnsafeCell<Box<PageBuf>>,
    pins: AtomicU64,
    dirty: AtomicBool,
    latch: Latch,
}

// SAFETY: the UnsafeCell is the only non-Sync field. Access to the buffer
// follows the latch protocol: readers hold the frame latch shared, writers
// hold it exclusive, and the pool reloads the buffer only while holding the
// pool lock with the pin count at zero, when no guard over this frame can
// exist.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            data: UnsafeCell::new(Box::new(PageBuf([0u8; PAGE_SIZE]))),
            pins: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            latch: Latch::new(),
        }
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unpinned frame");
    }

    pub(crate) fn pin_count(&self) -> u64 {
        self.pins.load(Ordering::Acquire)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Reads the frame buffer.
    ///
    /// # Safety
    ///
    /// The caller must hold the frame latch (shared or exclusive), or hold
    /// the pool lock while the frame's pin count is such that no latch
    /// holder can exist (eviction, load, allocation stamping).
    pub(crate) unsafe fn data(&self) -> &[u8; PAGE_SIZE] {
        &(*self.data.get()).0
    }

    /// Writes the frame buffer.
    ///
    /// # Safety
    ///
    /// The caller must hold the frame latch exclusively, or hold the pool
    /// lock under the same no-other-holder conditions as [`Frame::data`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut [u8; PAGE_SIZE] {
        &mut (*self.data.get()).0
    }
}
