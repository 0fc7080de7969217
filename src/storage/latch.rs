//! # Shared/Exclusive Spin Latch
//!
//! A latch is one 64-bit word counting holders. Readers CAS-increment the
//! word while it is below [`EXCLUSIVE`]; a writer CASes it from 0 to
//! `EXCLUSIVE`, which doubles as the "exclusively held" sentinel. Contended
//! acquisition busy-waits on a plain load until the blocking condition
//! clears, then retries the CAS.
//!
//! Latches are not re-entrant and not fair; they protect page-sized
//! critical sections that never block on anything slower than one page
//! write. Acquisition hands back a [`LatchGuard`] that releases on drop, so
//! a latch cannot leak across an early return.
//!
//! The buffer pool also drives latches through the raw
//! `lock_*`/`unlock_*` pairs when the release has to happen from a guard
//! that owns other state (see `LatchedPage`); the raw API subtracts the
//! holder's shares with Release ordering exactly as the guard does.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel stored in the hold word while a writer owns the latch.
pub const EXCLUSIVE: u64 = u64::MAX;

#[derive(Debug)]
pub struct Latch {
    holds: AtomicU64,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            holds: AtomicU64::new(0),
        }
    }

    /// Acquires a shared hold, spinning while a writer is in place.
    pub fn shared(&self) -> LatchGuard<'_> {
        self.lock_shared();
        LatchGuard {
            latch: self,
            shares: 1,
        }
    }

    /// Acquires the exclusive hold, spinning while any holder is in place.
    pub fn exclusive(&self) -> LatchGuard<'_> {
        self.lock_exclusive();
        LatchGuard {
            latch: self,
            shares: EXCLUSIVE,
        }
    }

    pub(crate) fn lock_shared(&self) {
        loop {
            let holds = self.holds.load(Ordering::Relaxed);
            if holds >= EXCLUSIVE {
                std::hint::spin_loop();
                continue;
            }
            if self
                .holds
                .compare_exchange_weak(holds, holds + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn lock_exclusive(&self) {
        loop {
            if self
                .holds
                .compare_exchange_weak(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.holds.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
    }

    /// Attempts a shared hold without spinning on a writer. Used by flush
    /// paths that already hold the pool lock and must not wait on latch
    /// holders who may in turn be waiting on the pool.
    pub(crate) fn try_lock_shared(&self) -> bool {
        loop {
            let holds = self.holds.load(Ordering::Relaxed);
            if holds >= EXCLUSIVE {
                return false;
            }
            if self
                .holds
                .compare_exchange_weak(holds, holds + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn unlock_shared(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0 && prev != EXCLUSIVE, "unpaired shared release");
    }

    pub(crate) fn unlock_exclusive(&self) {
        let prev = self.holds.fetch_sub(EXCLUSIVE, Ordering::Release);
        debug_assert_eq!(prev, EXCLUSIVE, "unpaired exclusive release");
    }

    /// Forces the latch back to unheld. Only valid while the owning frame is
    /// being repurposed under the pool lock, when no guard can exist.
    pub(crate) fn reset(&self) {
        self.holds.store(0, Ordering::Release);
    }

    /// Current raw hold count; `EXCLUSIVE` while a writer owns the latch.
    pub fn holds(&self) -> u64 {
        self.holds.load(Ordering::Acquire)
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope guard for one latch acquisition. Dropping releases the recorded
/// shares; the guard stays on the acquiring thread.
#[derive(Debug)]
pub struct LatchGuard<'a> {
    latch: &'a Latch,
    shares: u64,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.holds.fetch_sub(self.shares, Ordering::Release);
    }
}
