//! # Buffer Pool
//!
//! A fixed set of in-memory frames caching pages of one backing file, with
//! the page allocator (the on-disk bitmap directory) embedded in the same
//! file and walked through the same frames.
//!
//! ## Structure
//!
//! ```text
//! BufferPool
//! ├── core: Mutex<PoolCore>      // frame table, op counter, backing file
//! └── frames: Box<[Frame]>       // buffers, pins, dirty flags, latches
//! ```
//!
//! The pool lock (`core`) serializes frame-table traversal, victim choice,
//! directory walks and all disk I/O. Everything a caller touches after a
//! pin returns - the pin count, the frame latch, the buffer - lives outside
//! the lock, so holding a pinned or latched page never blocks the pool
//! beyond that one frame.
//!
//! ## Pin Protocol
//!
//! `pin` hands back a [`PinnedPage`] guard that keeps the frame resident
//! until dropped; dropping never does I/O. `pin_latched` composes the pin
//! with a frame-latch acquisition and returns a [`LatchedPage`] whose drop
//! releases the latch and then the pin. Because the pool lock is released
//! before any caller-facing latch is taken, the pool cannot deadlock with
//! its own callers: the only latches taken while the lock is held are on
//! directory pages and on victim frames with zero pins, neither of which a
//! caller can be waiting on while holding anything the pool needs.
//!
//! ## Eviction
//!
//! Replacement picks the first dead frame, else the unpinned frame with
//! the smallest last-access stamp; if every frame is pinned the pin fails
//! with [`StorageError::Full`]. A dirty victim is written back under its
//! shared latch before the frame is repurposed.
//!
//! ## Allocation
//!
//! `allocate` walks the directory list from the permanently pinned head
//! (page 0), clears the first free bit, and seeds a successor directory
//! page at stride `PAGES_PER_DIRECTORY` when the tail fills. The walk may
//! re-enter the pin machinery while the pool lock is held, which is why
//! the internal `pin_impl` is separate from the public `pin`.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{MIN_POOL_FRAMES, PAGE_SIZE, PAGES_PER_DIRECTORY};

use super::{
    DirectoryRef, DirectoryRefMut, Frame, PageHeader, PageId, PageType, PagedFile, StorageError,
    StorageResult,
};

/// Frame index of the permanently pinned directory head.
const HEAD_FRAME: usize = 0;

/// Which way a [`LatchedPage`] holds its frame latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchKind {
    Shared,
    Exclusive,
}

/// Pool-lock-protected state of one frame. The frame's logical identity;
/// a frame is not tied to a disk page until loaded.
struct FrameMeta {
    live: bool,
    page_id: PageId,
    page_type: PageType,
    last_access: u64,
}

impl FrameMeta {
    fn dead() -> Self {
        Self {
            live: false,
            page_id: 0,
            page_type: PageType::Free,
            last_access: 0,
        }
    }
}

struct PoolCore {
    file: PagedFile,
    meta: Box<[FrameMeta]>,
    op: u64,
}

pub struct BufferPool {
    core: Mutex<PoolCore>,
    frames: Box<[Frame]>,
}

/// A page-id reservation taken out of a directory page, with the owning
/// directory frame still pinned so the bit can be restored if the
/// subsequent load fails.
struct ReservedId {
    page_id: PageId,
    dir_idx: usize,
    dir_offset: usize,
    dir_extra_pin: bool,
}

impl BufferPool {
    /// Builds a pool of `n_frames` frames over the backing file, loading
    /// and permanently pinning the directory head (page 0). A fresh file
    /// gets its head formatted here.
    pub fn new(file: PagedFile, n_frames: usize) -> StorageResult<Self> {
        assert!(
            n_frames >= MIN_POOL_FRAMES,
            "buffer pool needs at least {MIN_POOL_FRAMES} frames"
        );

        let frames: Box<[Frame]> = (0..n_frames).map(|_| Frame::new()).collect();
        let meta: Box<[FrameMeta]> = (0..n_frames).map(|_| FrameMeta::dead()).collect();
        let pool = Self {
            core: Mutex::new(PoolCore { file, meta, op: 0 }),
            frames,
        };

        {
            let mut core_guard = pool.core.lock();
            let core = &mut *core_guard;
            let idx = pool.pin_impl(core, 0, Some(PageType::Directory))?;
            debug_assert_eq!(idx, HEAD_FRAME);

            if core.meta[idx].page_type != PageType::Directory {
                let frame = &pool.frames[idx];
                // SAFETY: pool lock held and the only pin is ours, so no
                // latch holder can exist.
                DirectoryRefMut::format(unsafe { frame.data_mut() }, 0);
                frame.mark_dirty();
                core.meta[idx].page_type = PageType::Directory;
                debug!("formatted fresh page directory head");
            }
            // The head pin is never released; the frame stays resident for
            // the pool's lifetime.
        }

        Ok(pool)
    }

    /// Pins a page, loading it into a frame if necessary. With an expected
    /// type, a formatted page of any other non-free kind fails with
    /// [`StorageError::PageTypeMismatch`].
    pub fn pin(
        &self,
        page_id: PageId,
        expected: Option<PageType>,
    ) -> StorageResult<PinnedPage<'_>> {
        let mut core_guard = self.core.lock();
        let frame = self.pin_impl(&mut core_guard, page_id, expected)?;
        drop(core_guard);
        Ok(PinnedPage {
            pool: self,
            frame,
            page_id,
        })
    }

    /// Pin composed with a frame-latch acquisition. The pool lock is
    /// released before the latch is taken.
    pub fn pin_latched(
        &self,
        page_id: PageId,
        expected: Option<PageType>,
        kind: LatchKind,
    ) -> StorageResult<LatchedPage<'_>> {
        let pin = self.pin(page_id, expected)?;
        Ok(self.latch_pin(pin, kind))
    }

    /// Allocates a page of the given kind: reserves an id in the directory,
    /// loads the page, zeroes it and stamps its header. Returns it pinned.
    pub fn allocate(&self, page_type: PageType) -> StorageResult<PinnedPage<'_>> {
        let mut core_guard = self.core.lock();
        let core = &mut *core_guard;

        let reserved = self.reserve_id(core)?;
        let page_id = reserved.page_id;

        let frame_idx = match self.pin_impl(core, page_id, Some(page_type)) {
            Ok(idx) => idx,
            Err(e) => {
                self.unreserve_id(&reserved);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_idx];
        {
            // SAFETY: pool lock held and the only pin is ours, so no latch
            // holder can exist.
            let data = unsafe { frame.data_mut() };
            data.fill(0);
            PageHeader::format(data, page_id, page_type);
        }
        frame.mark_dirty();
        core.meta[frame_idx].page_type = page_type;

        if reserved.dir_extra_pin {
            self.frames[reserved.dir_idx].unpin();
        }
        debug!(page_id, ?page_type, "allocated page");

        drop(core_guard);
        Ok(PinnedPage {
            pool: self,
            frame: frame_idx,
            page_id,
        })
    }

    /// Allocation composed with a frame-latch acquisition.
    pub fn alloc_latched(
        &self,
        page_type: PageType,
        kind: LatchKind,
    ) -> StorageResult<LatchedPage<'_>> {
        let pin = self.allocate(page_type)?;
        Ok(self.latch_pin(pin, kind))
    }

    /// Returns a page id to the directory and retags the page as free.
    /// Fails with [`StorageError::CannotFree`] if the caller still holds a
    /// pin on it, and [`StorageError::PageNotFound`] if no directory page
    /// covers the id.
    pub fn free(&self, page_id: PageId) -> StorageResult<()> {
        let mut core_guard = self.core.lock();
        let core = &mut *core_guard;

        let (dir_idx, dir_pinned) = self.locate_directory(core, page_id)?;
        let dir_frame = &self.frames[dir_idx];

        // Pin the target and check residual pins before touching the
        // bitmap, so a failed free leaves the directory unchanged.
        let target_idx = match self.pin_impl(core, page_id, None) {
            Ok(idx) => idx,
            Err(e) => {
                if dir_pinned {
                    dir_frame.unpin();
                }
                return Err(e);
            }
        };
        let target = &self.frames[target_idx];
        if target.pin_count() > 1 {
            target.unpin();
            if dir_pinned {
                dir_frame.unpin();
            }
            return Err(StorageError::CannotFree(page_id));
        }
        // Directory pages are structural; handing one back would tear the
        // allocator's own linked list.
        if core.meta[target_idx].page_type == PageType::Directory {
            target.unpin();
            if dir_pinned {
                dir_frame.unpin();
            }
            return Err(StorageError::Invalid {
                page_id,
                reason: "cannot free a directory page",
            });
        }

        let offset = (page_id - core.meta[dir_idx].page_id - 1) as usize;
        {
            let _latch = dir_frame.latch().exclusive();
            // SAFETY: exclusive latch held.
            let mut view = DirectoryRefMut::new(unsafe { dir_frame.data_mut() });
            debug_assert!(
                !view.as_ref().is_free(offset),
                "freeing page {page_id} twice"
            );
            view.set_bit(offset);
        }
        dir_frame.mark_dirty();

        {
            // SAFETY: pool lock held and the only pin is ours.
            let data = unsafe { target.data_mut() };
            PageHeader::from_page_mut(data).set_page_type(PageType::Free);
        }
        core.meta[target_idx].page_type = PageType::Free;
        target.mark_dirty();
        target.unpin();

        if dir_pinned {
            dir_frame.unpin();
        }
        debug!(page_id, "freed page");
        Ok(())
    }

    /// Writes back every dirty resident page and syncs the file. A frame
    /// whose latch is exclusively held is skipped and stays dirty: its
    /// holder may be blocked on the pool lock we hold, and it will reach
    /// disk on eviction or a later flush.
    pub fn flush_all(&self) -> StorageResult<()> {
        let mut core_guard = self.core.lock();
        let core = &mut *core_guard;

        for idx in 0..core.meta.len() {
            if !core.meta[idx].live {
                continue;
            }
            let frame = &self.frames[idx];
            if !frame.is_dirty() {
                continue;
            }
            let page_id = core.meta[idx].page_id;
            if !frame.latch().try_lock_shared() {
                continue;
            }
            // The dirty flag clears before the write, inside the latch: a
            // writer needs the exclusive latch to redirty the page, so it
            // cannot slip in between the clear and the write.
            frame.clear_dirty();
            // SAFETY: shared latch held.
            let result = core.file.write_page(page_id, unsafe { frame.data() });
            frame.latch().unlock_shared();
            if let Err(e) = result {
                frame.mark_dirty();
                return Err(e);
            }
        }
        core.file.sync()
    }

    /// Whether a page currently occupies a frame.
    pub fn is_resident(&self, page_id: PageId) -> bool {
        let core = self.core.lock();
        core.meta.iter().any(|m| m.live && m.page_id == page_id)
    }

    /// Number of resident pages with unwritten modifications.
    pub fn dirty_page_count(&self) -> usize {
        let core = self.core.lock();
        core.meta
            .iter()
            .enumerate()
            .filter(|(idx, m)| m.live && self.frames[*idx].is_dirty())
            .count()
    }

    fn latch_pin<'a>(&'a self, pin: PinnedPage<'a>, kind: LatchKind) -> LatchedPage<'a> {
        let latch = self.frames[pin.frame].latch();
        match kind {
            LatchKind::Shared => latch.lock_shared(),
            LatchKind::Exclusive => latch.lock_exclusive(),
        }
        LatchedPage { pin, kind }
    }

    /// The pin machinery proper. Assumes the pool lock is held; `allocate`
    /// and `free` re-enter it while walking directory pages.
    fn pin_impl(
        &self,
        core: &mut PoolCore,
        page_id: PageId,
        expected: Option<PageType>,
    ) -> StorageResult<usize> {
        // Already resident?
        if let Some(idx) = core
            .meta
            .iter()
            .position(|m| m.live && m.page_id == page_id)
        {
            let found = core.meta[idx].page_type;
            if let Some(expected) = expected {
                if found != PageType::Free && found != expected {
                    return Err(StorageError::PageTypeMismatch {
                        page_id,
                        expected,
                        found,
                    });
                }
            }
            self.frames[idx].pin();
            core.op += 1;
            core.meta[idx].last_access = core.op;
            trace!(page_id, frame = idx, "buffer pool hit");
            return Ok(idx);
        }

        let victim = self.choose_victim(core).ok_or(StorageError::Full)?;
        let frame = &self.frames[victim];

        if core.meta[victim].live && frame.is_dirty() {
            let evicted = core.meta[victim].page_id;
            let latch_guard = frame.latch().shared();
            frame.clear_dirty();
            // SAFETY: shared latch held.
            let result = core.file.write_page(evicted, unsafe { frame.data() });
            drop(latch_guard);
            if let Err(e) = result {
                frame.mark_dirty();
                return Err(e);
            }
            trace!(page_id = evicted, frame = victim, "evicted dirty page");
        }

        core.meta[victim].live = false;
        {
            // SAFETY: pool lock held and the victim has zero pins, so no
            // latch holder or buffer reference can exist.
            let data = unsafe { frame.data_mut() };
            core.file.read_page(page_id, data)?;
        }

        // SAFETY: as above; the shared view only outlives the read.
        let header = PageHeader::from_page(unsafe { frame.data() });
        let page_type = if header.is_formatted() {
            if header.page_id() != page_id {
                return Err(StorageError::Invalid {
                    page_id,
                    reason: "header page id does not match requested page",
                });
            }
            match header.page_type() {
                Some(t) => t,
                None => {
                    return Err(StorageError::Invalid {
                        page_id,
                        reason: "unknown page type byte",
                    })
                }
            }
        } else {
            PageType::Free
        };

        if let Some(expected) = expected {
            if page_type != PageType::Free && page_type != expected {
                return Err(StorageError::PageTypeMismatch {
                    page_id,
                    expected,
                    found: page_type,
                });
            }
        }

        frame.clear_dirty();
        frame.latch().reset();
        frame.pin();
        core.op += 1;
        core.meta[victim] = FrameMeta {
            live: true,
            page_id,
            page_type,
            last_access: core.op,
        };
        trace!(page_id, frame = victim, "loaded page");
        Ok(victim)
    }

    /// First dead frame, else the unpinned frame with the smallest
    /// last-access stamp.
    fn choose_victim(&self, core: &PoolCore) -> Option<usize> {
        if let Some(idx) = core.meta.iter().position(|m| !m.live) {
            return Some(idx);
        }

        let mut best: Option<(usize, u64)> = None;
        for (idx, meta) in core.meta.iter().enumerate() {
            if self.frames[idx].pin_count() != 0 {
                continue;
            }
            match best {
                Some((_, last)) if meta.last_access >= last => {}
                _ => best = Some((idx, meta.last_access)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Walks the directory list and clears the first free bit, seeding a
    /// successor directory page when the tail is full. The owning
    /// directory frame stays pinned in the returned reservation.
    fn reserve_id(&self, core: &mut PoolCore) -> StorageResult<ReservedId> {
        let mut cur = HEAD_FRAME;
        let mut cur_pinned = false;

        loop {
            if core.meta[cur].page_type != PageType::Directory {
                panic!(
                    "corrupt page directory: page {} is not a directory page",
                    core.meta[cur].page_id
                );
            }
            let dir_page_id = core.meta[cur].page_id;
            let frame = &self.frames[cur];

            let (slot, next) = {
                let _latch = frame.latch().shared();
                // SAFETY: shared latch held.
                let view = DirectoryRef::new(unsafe { frame.data() });
                (view.first_free(), view.next())
            };

            if let Some(offset) = slot {
                {
                    let _latch = frame.latch().exclusive();
                    // SAFETY: exclusive latch held.
                    let mut view = DirectoryRefMut::new(unsafe { frame.data_mut() });
                    view.clear_bit(offset);
                }
                frame.mark_dirty();
                return Ok(ReservedId {
                    page_id: dir_page_id + offset as PageId + 1,
                    dir_idx: cur,
                    dir_offset: offset,
                    dir_extra_pin: cur_pinned,
                });
            }

            let next_idx = if next == 0 {
                // Full tail: seed the successor at the reserved stride.
                let seed_id = dir_page_id + PAGES_PER_DIRECTORY as PageId;
                let idx = match self.pin_impl(core, seed_id, None) {
                    Ok(idx) => idx,
                    Err(e) => {
                        if cur_pinned {
                            frame.unpin();
                        }
                        return Err(e);
                    }
                };
                {
                    let seed_frame = &self.frames[idx];
                    // SAFETY: pool lock held and the fresh pin is ours.
                    DirectoryRefMut::format(unsafe { seed_frame.data_mut() }, seed_id);
                    seed_frame.mark_dirty();
                }
                core.meta[idx].page_type = PageType::Directory;

                // Link only after the successor is formatted, so a failed
                // load never leaves the list pointing at garbage.
                {
                    let _latch = frame.latch().exclusive();
                    // SAFETY: exclusive latch held.
                    let mut view = DirectoryRefMut::new(unsafe { frame.data_mut() });
                    view.set_next(seed_id);
                }
                frame.mark_dirty();
                debug!(page_id = seed_id, "grew page directory");
                idx
            } else {
                match self.pin_impl(core, next, Some(PageType::Directory)) {
                    Ok(idx) => idx,
                    Err(StorageError::PageTypeMismatch { page_id, .. }) => {
                        panic!("corrupt page directory: page {page_id} is not a directory page")
                    }
                    Err(e) => {
                        if cur_pinned {
                            frame.unpin();
                        }
                        return Err(e);
                    }
                }
            };

            if cur_pinned {
                frame.unpin();
            }
            cur = next_idx;
            cur_pinned = true;
        }
    }

    /// Restores a reservation whose page load failed.
    fn unreserve_id(&self, reserved: &ReservedId) {
        let frame = &self.frames[reserved.dir_idx];
        {
            let _latch = frame.latch().exclusive();
            // SAFETY: exclusive latch held.
            let mut view = DirectoryRefMut::new(unsafe { frame.data_mut() });
            view.set_bit(reserved.dir_offset);
        }
        frame.mark_dirty();
        if reserved.dir_extra_pin {
            frame.unpin();
        }
    }

    /// Finds the directory page covering `page_id`, leaving it pinned when
    /// it is not the head.
    fn locate_directory(
        &self,
        core: &mut PoolCore,
        page_id: PageId,
    ) -> StorageResult<(usize, bool)> {
        let mut cur = HEAD_FRAME;
        let mut cur_pinned = false;

        loop {
            if core.meta[cur].page_type != PageType::Directory {
                panic!(
                    "corrupt page directory: page {} is not a directory page",
                    core.meta[cur].page_id
                );
            }
            let dir_page_id = core.meta[cur].page_id;
            if page_id > dir_page_id && page_id <= dir_page_id + PAGES_PER_DIRECTORY as PageId {
                return Ok((cur, cur_pinned));
            }

            let frame = &self.frames[cur];
            let next = {
                let _latch = frame.latch().shared();
                // SAFETY: shared latch held.
                DirectoryRef::new(unsafe { frame.data() }).next()
            };
            if next == 0 {
                if cur_pinned {
                    frame.unpin();
                }
                return Err(StorageError::PageNotFound(page_id));
            }

            let next_idx = match self.pin_impl(core, next, Some(PageType::Directory)) {
                Ok(idx) => idx,
                Err(StorageError::PageTypeMismatch { page_id, .. }) => {
                    panic!("corrupt page directory: page {page_id} is not a directory page")
                }
                Err(e) => {
                    if cur_pinned {
                        frame.unpin();
                    }
                    return Err(e);
                }
            };
            if cur_pinned {
                frame.unpin();
            }
            cur = next_idx;
            cur_pinned = true;
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // Best-effort writeback so a clean shutdown persists everything.
        let _ = self.flush_all();
    }
}

/// Refcount guard for one pinned page. Dropping unpins; it never does I/O.
pub struct PinnedPage<'a> {
    pool: &'a BufferPool,
    frame: usize,
    page_id: PageId,
}

impl PinnedPage<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pool.frames[self.frame].unpin();
    }
}

/// A pinned page with its frame latch held. Dropping releases the latch
/// first, then the pin.
pub struct LatchedPage<'a> {
    pin: PinnedPage<'a>,
    kind: LatchKind,
}

impl LatchedPage<'_> {
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn kind(&self) -> LatchKind {
        self.kind
    }

    /// The page bytes. Valid under either latch mode.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        // SAFETY: the frame latch is held for the lifetime of this guard,
        // and the returned borrow cannot outlive it.
        unsafe { self.pin.pool.frames[self.pin.frame].data() }
    }

    /// The page bytes, writable. Requires the exclusive latch; marks the
    /// frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        assert!(
            self.kind == LatchKind::Exclusive,
            "data_mut requires an exclusive latch"
        );
        let frame = &self.pin.pool.frames[self.pin.frame];
        frame.mark_dirty();
        // SAFETY: exclusive latch held; &mut self prevents aliased views.
        unsafe { frame.data_mut() }
    }
}

impl Drop for LatchedPage<'_> {
    fn drop(&mut self) {
        let latch = self.pin.pool.frames[self.pin.frame].latch();
        match self.kind {
            LatchKind::Shared => latch.unlock_shared(),
            LatchKind::Exclusive => latch.unlock_exclusive(),
        }
        // The pin field drops after this, releasing the refcount.
    }
}
