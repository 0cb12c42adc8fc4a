//! Background maintenance: incremental table migration and bloom rebuild.
//!
//! One cleaner thread per store. It sleeps on a condvar until signalled
//! (resize request, shutdown) or until its period elapses, then runs at
//! most one migration pass and one bloom rebuild pass, and persists the
//! bloom snapshot and store state.
//!
//! A migration runs bounded rounds over the old table region. Each round
//! scans slots `0..=watermark`, resolving stale entries (those stamped
//! with a different capacity than the current one) in place, by moving, by
//! duplicate elimination, or by parking them in a bounded overflow spool;
//! the spool is drained after every scan. Entries that remain unplaceable
//! when the round budget runs out are dropped — explicit, logged data loss
//! accepted by a bounded-effort shrink. Errors on individual slots are
//! never escalated; the slot is retried on a later round.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block::BlockCodec;
use crate::entry::{EntryMeta, SealedEntry, METADATA_LEN};
use crate::placement::candidate_slots;
use crate::spool::OverflowSpool;
use crate::store::StoreInner;

/// Total rounds a migration may spend before giving up on stragglers.
const MAX_ROUNDS: u32 = 16;

/// Rounds after which unplaceable entries are spooled instead of retried.
/// Early rounds leave them in place: in-place resolution gets cheaper as
/// neighboring slots drain.
const RELAXED_ROUNDS: u32 = 8;

/// How many slots are scanned between shutdown checks.
const SHUTDOWN_CHECK_INTERVAL: u64 = 256;

/// What happened to one scanned slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolve {
    /// Slot is free.
    Free,
    /// Entry already carries the current capacity stamp.
    Current,
    /// Entry was a candidate of its own slot; only the stamp was rewritten.
    Restamped,
    /// Entry moved to a free candidate slot.
    Moved,
    /// Entry was a duplicate of one already placed; source dropped.
    Duplicate,
    /// Entry parked in the overflow spool.
    Spooled,
    /// Entry could not be resolved this round (contention, I/O error, or
    /// a full neighborhood in an early round).
    Retry,
}

/// Per-migration counters, logged at completion.
#[derive(Debug, Default)]
struct MigrationTally {
    free: u64,
    current: u64,
    restamped: u64,
    moved: u64,
    duplicates: u64,
    spooled: u64,
    dropped: u64,
}

/// The cleaner thread body.
pub(crate) fn cleaner_loop<C: BlockCodec>(inner: Arc<StoreInner<C>>) {
    loop {
        {
            let mut flag = inner.cleaner_flag.lock();
            if !*flag {
                let _ = inner
                    .cleaner_wake
                    .wait_for(&mut flag, inner.tuning.cleaner_period);
            }
            *flag = false;
        }
        if inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }

        if inner.table.read().previous_capacity != 0 {
            if let Some(_pass) = inner.migration_lock.try_lock() {
                run_migration(&inner);
            }
        }

        if inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }

        if inner.bloom.needs_rebuild() && inner.table.read().previous_capacity == 0 {
            if let Some(_pass) = inner.migration_lock.try_lock() {
                run_bloom_rebuild(&inner);
            }
        }

        if let Err(err) = inner.bloom.persist() {
            warn!(
                target: "saltbox::cleaner",
                store = %inner.name,
                error = %err,
                "bloom snapshot write failed"
            );
        }
        {
            let table = inner.table.read();
            if let Err(err) = inner.persist_state(&table) {
                warn!(
                    target: "saltbox::cleaner",
                    store = %inner.name,
                    error = %err,
                    "state write failed"
                );
            }
        }
    }
}

/// Migrate entries from the previous table size to the current one.
///
/// Caller holds the migration lock. Runs to completion, a shutdown, or the
/// round budget.
pub(crate) fn run_migration<C: BlockCodec>(inner: &StoreInner<C>) {
    let (capacity, previous) = {
        let table = inner.table.read();
        (table.capacity, table.previous_capacity)
    };
    if previous == 0 {
        return;
    }
    info!(
        target: "saltbox::cleaner",
        store = %inner.name,
        capacity,
        previous_capacity = previous,
        "starting table migration"
    );

    if capacity > previous {
        if let Err(err) = inner.shards.ensure_slots(capacity) {
            warn!(
                target: "saltbox::cleaner",
                store = %inner.name,
                error = %err,
                "cannot grow data files, migration deferred"
            );
            return;
        }
    }

    let mut spool = OverflowSpool::new(
        inner.spool_path.clone(),
        inner.layout.entry_size as u64,
        inner.tuning.spool_budget,
    );
    let mut tally = MigrationTally::default();
    let mut watermark = previous - 1;
    let mut complete = false;

    for round in 1..=MAX_ROUNDS {
        let mut highest_unresolved = None;

        for slot in 0..=watermark {
            if slot % SHUTDOWN_CHECK_INTERVAL == 0
                && inner.shutdown.load(std::sync::atomic::Ordering::Acquire)
            {
                spool.destroy();
                return;
            }
            match resolve_slot(inner, slot, capacity, round, &mut spool) {
                Resolve::Free => tally.free += 1,
                Resolve::Current => tally.current += 1,
                Resolve::Restamped => tally.restamped += 1,
                Resolve::Moved => tally.moved += 1,
                Resolve::Duplicate => tally.duplicates += 1,
                Resolve::Spooled => tally.spooled += 1,
                Resolve::Retry => highest_unresolved = Some(slot),
            }
        }

        drain_spool(inner, &mut spool, capacity, &mut tally);

        match highest_unresolved {
            None => {
                complete = true;
                break;
            }
            Some(highest) => watermark = highest,
        }
        debug!(
            target: "saltbox::cleaner",
            store = %inner.name,
            round,
            watermark,
            "migration round finished with stale entries remaining"
        );
    }

    if !complete {
        // round budget exhausted: whatever is still stale is dropped so the
        // old region can be reclaimed
        give_up_stale(inner, watermark, capacity, &mut tally);
    }

    {
        let mut table = inner.table.write();
        if table.previous_capacity != previous {
            // a competing transition already happened; nothing to publish
            spool.destroy();
            return;
        }
        table.previous_capacity = 0;
        if let Err(err) = inner.persist_state(&table) {
            warn!(
                target: "saltbox::cleaner",
                store = %inner.name,
                error = %err,
                "state write failed at migration end"
            );
        }
    }

    if capacity < previous {
        if let Err(err) = inner.shards.truncate_slots(capacity) {
            warn!(
                target: "saltbox::cleaner",
                store = %inner.name,
                error = %err,
                "could not truncate data files after shrink"
            );
        }
    }
    spool.destroy();

    if tally.dropped > 0 {
        warn!(
            target: "saltbox::cleaner",
            store = %inner.name,
            dropped = tally.dropped,
            "migration dropped entries that could not be placed"
        );
    }
    info!(
        target: "saltbox::cleaner",
        store = %inner.name,
        capacity,
        free = tally.free,
        current = tally.current,
        restamped = tally.restamped,
        moved = tally.moved,
        duplicates = tally.duplicates,
        spooled = tally.spooled,
        dropped = tally.dropped,
        "table migration finished"
    );
}

/// Resolve one slot of the old table region.
fn resolve_slot<C: BlockCodec>(
    inner: &StoreInner<C>,
    slot: u64,
    capacity: u64,
    round: u32,
    spool: &mut OverflowSpool,
) -> Resolve {
    // cheap look first: metadata only, single slot lock
    let meta = {
        let Some(_guard) = inner.locks.lock(slot) else {
            return Resolve::Retry;
        };
        let mut buf = [0u8; METADATA_LEN];
        match inner.shards.read_meta(slot, &mut buf) {
            Ok(()) => {}
            Err(err) => {
                debug!(
                    target: "saltbox::cleaner",
                    store = %inner.name,
                    slot,
                    error = %err,
                    "slot read failed, retrying next round"
                );
                return Resolve::Retry;
            }
        }
        match EntryMeta::parse(&buf, &inner.layout) {
            None => return Resolve::Free,
            Some(meta) => meta,
        }
    };
    if meta.capacity_stamp() == capacity {
        return Resolve::Current;
    }

    let candidates = candidate_slots(meta.digest(), capacity);

    if candidates.contains(&slot) {
        // cheap resolve: the entry already sits on one of its new
        // candidates, only the stamp needs rewriting
        let Some(_guard) = inner.locks.lock(slot) else {
            return Resolve::Retry;
        };
        let mut buf = [0u8; METADATA_LEN];
        if inner.shards.read_meta(slot, &mut buf).is_err() {
            return Resolve::Retry;
        }
        let Some(mut current) = EntryMeta::parse(&buf, &inner.layout) else {
            return Resolve::Free;
        };
        if current.digest() != meta.digest() || current.capacity_stamp() == capacity {
            return Resolve::Current; // changed under us, resolved elsewhere
        }
        current.restamp(capacity);
        match inner.shards.write_meta(slot, &current.encode()) {
            Ok(()) => Resolve::Restamped,
            Err(_) => Resolve::Retry,
        }
    } else {
        // relocation: take the source and every candidate together, in
        // sorted order, before touching anything
        let mut lock_slots = candidates.to_vec();
        lock_slots.push(slot);
        lock_slots.sort_unstable();
        lock_slots.dedup();
        let Some(_guards) = inner.locks.lock_set(&lock_slots) else {
            return Resolve::Retry;
        };

        let mut image = vec![0u8; inner.layout.entry_size];
        if inner.shards.read_entry(slot, &mut image).is_err() {
            return Resolve::Retry;
        }
        let Some(mut entry) = SealedEntry::parse(&image, &inner.layout) else {
            return Resolve::Free;
        };
        if entry.digest() != meta.digest() || entry.capacity_stamp() == capacity {
            return Resolve::Current; // changed under us
        }

        let mut meta_buf = [0u8; METADATA_LEN];
        let mut free_candidate = None;
        let mut duplicate = false;
        for candidate in candidates {
            match inner.shards.read_meta(candidate, &mut meta_buf) {
                Ok(()) => {}
                Err(_) => continue,
            }
            match EntryMeta::parse(&meta_buf, &inner.layout) {
                None => {
                    if free_candidate.is_none() {
                        free_candidate = Some(candidate);
                    }
                }
                Some(other) if other.digest() == entry.digest() => {
                    duplicate = true;
                    break;
                }
                Some(_) => {}
            }
        }

        if let Some(target) = free_candidate {
            if duplicate {
                // a copy of this key already landed in the new table; the
                // source is redundant whatever else happens
                return drop_duplicate(inner, slot);
            }
            entry.restamp(capacity);
            let written = inner
                .shards
                .write_entry(target, &entry.to_bytes(&inner.layout))
                .and_then(|()| inner.shards.free_slot(slot));
            return match written {
                Ok(()) => Resolve::Moved,
                Err(_) => Resolve::Retry,
            };
        }
        if duplicate {
            return drop_duplicate(inner, slot);
        }

        // every candidate is occupied by an unrelated key
        if round > RELAXED_ROUNDS {
            match spool.push(&entry.to_bytes(&inner.layout)) {
                Ok(true) => {
                    if inner.shards.free_slot(slot).is_err() {
                        return Resolve::Retry;
                    }
                    return Resolve::Spooled;
                }
                Ok(false) => return Resolve::Retry, // spool budget exhausted
                Err(err) => {
                    debug!(
                        target: "saltbox::cleaner",
                        store = %inner.name,
                        slot,
                        error = %err,
                        "spool write failed"
                    );
                    return Resolve::Retry;
                }
            }
        }
        Resolve::Retry
    }
}

fn drop_duplicate<C: BlockCodec>(inner: &StoreInner<C>, slot: u64) -> Resolve {
    match inner.shards.free_slot(slot) {
        Ok(()) => {
            inner.stats.dec_key_count();
            Resolve::Duplicate
        }
        Err(_) => Resolve::Retry,
    }
}

/// Retry placement of every spooled entry; whatever still does not fit is
/// dropped.
fn drain_spool<C: BlockCodec>(
    inner: &StoreInner<C>,
    spool: &mut OverflowSpool,
    capacity: u64,
    tally: &mut MigrationTally,
) {
    if spool.is_empty() {
        return;
    }

    let parked = spool.len();
    for index in 0..parked {
        let image = match spool.read(index) {
            Ok(image) => image,
            Err(err) => {
                warn!(
                    target: "saltbox::cleaner",
                    store = %inner.name,
                    index,
                    error = %err,
                    "spool read failed, entry dropped"
                );
                tally.dropped += 1;
                inner.stats.dec_key_count();
                continue;
            }
        };
        let Some(mut entry) = SealedEntry::parse(&image, &inner.layout) else {
            tally.dropped += 1;
            inner.stats.dec_key_count();
            continue;
        };
        entry.restamp(capacity);

        let candidates = candidate_slots(entry.digest(), capacity);
        let mut lock_slots = candidates.to_vec();
        lock_slots.sort_unstable();
        lock_slots.dedup();
        let Some(_guards) = inner.locks.lock_set(&lock_slots) else {
            // shutting down: everything still parked is lost
            tally.dropped += parked - index;
            return;
        };

        let mut meta_buf = [0u8; METADATA_LEN];
        let mut placed = false;
        let mut redundant = false;
        for candidate in candidates {
            if inner.shards.read_meta(candidate, &mut meta_buf).is_err() {
                continue;
            }
            match EntryMeta::parse(&meta_buf, &inner.layout) {
                None => {
                    if inner
                        .shards
                        .write_entry(candidate, &entry.to_bytes(&inner.layout))
                        .is_ok()
                    {
                        placed = true;
                    }
                    break;
                }
                Some(other) if other.digest() == entry.digest() => {
                    redundant = true;
                    break;
                }
                Some(_) => {}
            }
        }

        if placed {
            tally.moved += 1;
        } else if redundant {
            tally.duplicates += 1;
            inner.stats.dec_key_count();
        } else {
            debug!(
                target: "saltbox::cleaner",
                store = %inner.name,
                "spooled entry unplaceable, dropped"
            );
            tally.dropped += 1;
            inner.stats.dec_key_count();
        }
    }

    if let Err(err) = spool.clear() {
        warn!(
            target: "saltbox::cleaner",
            store = %inner.name,
            error = %err,
            "spool truncate failed"
        );
    }
}

/// Free every entry still stamped with a stale capacity. Runs only when
/// the round budget is exhausted; counted as dropped.
fn give_up_stale<C: BlockCodec>(
    inner: &StoreInner<C>,
    watermark: u64,
    capacity: u64,
    tally: &mut MigrationTally,
) {
    for slot in 0..=watermark {
        if slot % SHUTDOWN_CHECK_INTERVAL == 0
            && inner.shutdown.load(std::sync::atomic::Ordering::Acquire)
        {
            return;
        }
        let Some(_guard) = inner.locks.lock(slot) else {
            return;
        };
        let mut buf = [0u8; METADATA_LEN];
        if inner.shards.read_meta(slot, &mut buf).is_err() {
            continue;
        }
        let Some(meta) = EntryMeta::parse(&buf, &inner.layout) else {
            continue;
        };
        if meta.capacity_stamp() != capacity && inner.shards.free_slot(slot).is_ok() {
            inner.stats.dec_key_count();
            tally.dropped += 1;
        }
    }
}

/// Rebuild the bloom filter by scanning every occupied slot.
///
/// Runs only while no migration is in flight; puts racing the scan record
/// into the staging filter as well, so nothing is lost. Also corrects the
/// live-entry estimate.
pub(crate) fn run_bloom_rebuild<C: BlockCodec>(inner: &StoreInner<C>) {
    let capacity = inner.table.read().capacity;
    info!(
        target: "saltbox::cleaner",
        store = %inner.name,
        capacity,
        "rebuilding bloom filter"
    );

    inner.bloom.start_rebuild(capacity as usize);
    let mut live = 0u64;

    for slot in 0..capacity {
        if slot % SHUTDOWN_CHECK_INTERVAL == 0 {
            let abandoned = inner.shutdown.load(std::sync::atomic::Ordering::Acquire)
                || inner.table.read().previous_capacity != 0;
            if abandoned {
                inner.bloom.abandon_rebuild();
                return;
            }
        }
        let Some(_guard) = inner.locks.lock(slot) else {
            inner.bloom.abandon_rebuild();
            return;
        };
        let mut buf = [0u8; METADATA_LEN];
        if inner.shards.read_meta(slot, &mut buf).is_err() {
            continue;
        }
        if let Some(meta) = EntryMeta::parse(&buf, &inner.layout) {
            inner.bloom.record_staged(meta.digest());
            live += 1;
        }
    }

    inner.bloom.finish_rebuild();
    inner.stats.set_key_count(live);
    if let Err(err) = inner.bloom.persist() {
        warn!(
            target: "saltbox::cleaner",
            store = %inner.name,
            error = %err,
            "bloom snapshot write failed after rebuild"
        );
    }
    info!(
        target: "saltbox::cleaner",
        store = %inner.name,
        live_entries = live,
        "bloom filter rebuilt"
    );
}
