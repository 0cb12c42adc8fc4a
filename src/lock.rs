//! Per-slot mutual exclusion.
//!
//! Every read-modify-write of a single slot, by normal traffic or the
//! resize pass, happens under that slot's lock, so no two threads ever
//! touch the same byte range concurrently. Locks are not reentrant: a
//! caller holding a slot must never lock it again (guards cannot be
//! cloned, and the multi-slot path deduplicates its offsets first).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How often a blocked waiter wakes to re-check the shutdown flag.
const SHUTDOWN_RECHECK: Duration = Duration::from_secs(10);

#[derive(Default)]
struct LockState {
    /// Slots currently held.
    held: HashSet<u64>,
    /// Exclusive table-wide lock, taken once for the final flush/close.
    global: bool,
    shutdown: bool,
}

/// Transient in-memory table of held slot locks. Never persisted.
pub(crate) struct LockTable {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Block until the slot is acquired, or `None` once shutdown begins.
    ///
    /// The bounded wait exists only to observe shutdown; the operation is
    /// never abandoned while the store is running.
    pub(crate) fn lock(&self, slot: u64) -> Option<SlotGuard<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if !state.global && !state.held.contains(&slot) {
                state.held.insert(slot);
                return Some(SlotGuard { table: self, slot });
            }
            let _ = self.cond.wait_for(&mut state, SHUTDOWN_RECHECK);
        }
    }

    /// Acquire a sorted, deduplicated set of slots, in order.
    ///
    /// Either every slot is acquired or none remain held: a `None` return
    /// (shutdown) has already released any partial acquisition, and the
    /// returned guard releases all of them on every exit path.
    pub(crate) fn lock_set(&self, slots: &[u64]) -> Option<SlotSetGuard<'_>> {
        debug_assert!(slots.windows(2).all(|w| w[0] < w[1]), "sorted and deduplicated");

        let mut guards = Vec::with_capacity(slots.len());
        for &slot in slots {
            match self.lock(slot) {
                Some(guard) => guards.push(guard),
                // dropping the partial Vec releases everything acquired so far
                None => return None,
            }
        }
        Some(SlotSetGuard { _guards: guards })
    }

    /// Wake all waiters so they can observe shutdown and fail their
    /// acquisitions. No lock is granted after this.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Wait for every held slot to drain, then take the table exclusively.
    ///
    /// Used once, before the final flush/close. Returns `false` on timeout;
    /// the caller proceeds regardless, it just could not wait any longer.
    pub(crate) fn lock_global(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.held.is_empty() || state.global {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        state.global = true;
        true
    }

    /// Release the exclusive table lock.
    pub(crate) fn unlock_global(&self) {
        let mut state = self.state.lock();
        state.global = false;
        self.cond.notify_all();
    }

    fn release(&self, slot: u64) {
        let mut state = self.state.lock();
        let removed = state.held.remove(&slot);
        debug_assert!(removed, "released slot {slot} that was not held");
        self.cond.notify_all();
    }
}

/// Exclusive hold on one slot. Released on drop.
pub(crate) struct SlotGuard<'a> {
    table: &'a LockTable,
    slot: u64,
}

impl SlotGuard<'_> {
    pub(crate) fn slot(&self) -> u64 {
        self.slot
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.slot);
    }
}

/// Exclusive hold on a set of slots. Released together on drop.
pub(crate) struct SlotSetGuard<'a> {
    _guards: Vec<SlotGuard<'a>>,
}
