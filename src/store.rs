//! Store orchestration: fetch/put, resize requests, statistics, shutdown.
//!
//! [`SaltedStore`] composes the bloom gate, the placement engine, the slot
//! lock table and the entry codec into the public engine API, and owns the
//! one background cleaner thread that migrates the table between sizes.
//! All state lives in the store instance; two stores (one per block type)
//! are fully independent.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::block::BlockCodec;
use crate::bloom::BloomGate;
use crate::cipher::{EntryCipher, DIGEST_LEN, SALT_LEN};
use crate::cleaner;
use crate::config::{StoreState, StoreTuning};
use crate::entry::{EntryLayout, EntryMeta, SealedEntry, METADATA_LEN};
use crate::error::StoreError;
use crate::lock::LockTable;
use crate::placement::{candidate_slots, lock_offsets, PROBE_DEPTH};
use crate::shard::ShardFiles;
use crate::stats::{Snapshot, StoreStats};

/// How long shutdown waits for in-flight slot operations to drain before
/// flushing anyway.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The capacity fields guarded by the store-wide read/write lock.
///
/// Data-path operations and resize-scan entries hold the read side for
/// their whole duration; capacity-change bookkeeping and shutdown take the
/// write side. Individual entries stay protected by their slot locks.
pub(crate) struct TableState {
    pub capacity: u64,
    /// Non-zero exactly while a resize is migrating entries.
    pub previous_capacity: u64,
}

/// Everything shared between the public handle and the cleaner thread.
pub(crate) struct StoreInner<C: BlockCodec> {
    pub codec: C,
    pub name: String,
    pub layout: EntryLayout,
    pub cipher: EntryCipher,
    pub shards: ShardFiles,
    pub locks: LockTable,
    pub bloom: BloomGate,
    pub stats: StoreStats,
    pub tuning: StoreTuning,
    pub table: RwLock<TableState>,
    /// Serializes migration and bloom-rebuild passes, whichever thread
    /// runs them.
    pub migration_lock: Mutex<()>,
    /// Wake signal for the cleaner thread; the flag avoids lost wakeups.
    pub cleaner_flag: Mutex<bool>,
    pub cleaner_wake: Condvar,
    pub shutdown: AtomicBool,
    pub collision_possible: bool,
    pub save_plain_key: bool,
    pub state_path: PathBuf,
    pub spool_path: PathBuf,
}

impl<C: BlockCodec> StoreInner<C> {
    /// Persist the store-wide state next to the data files.
    pub(crate) fn persist_state(&self, table: &TableState) -> io::Result<()> {
        StoreState {
            salt: *self.cipher.salt(),
            capacity: table.capacity,
            previous_capacity: table.previous_capacity,
            key_count: self.stats.snapshot().key_count,
        }
        .write(&self.state_path)
    }

    pub(crate) fn wake_cleaner(&self) {
        let mut flag = self.cleaner_flag.lock();
        *flag = true;
        self.cleaner_wake.notify_all();
    }

    /// Probe both capacities for a full entry belonging to the key.
    ///
    /// Caller holds the lock-offset union for the digest. `UnexpectedEof`
    /// on a candidate (possible while a shrink is in flight) skips it.
    fn find_sealed(
        &self,
        digest: &[u8; DIGEST_LEN],
        routing_key: &[u8],
        capacity: u64,
        previous: u64,
    ) -> io::Result<Option<(u64, SealedEntry)>> {
        let mut image = vec![0u8; self.layout.entry_size];
        for probe_capacity in std::iter::once(capacity).chain((previous != 0).then_some(previous)) {
            for slot in candidate_slots(digest, probe_capacity) {
                match self.shards.read_entry(slot, &mut image) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => continue,
                    Err(err) => return Err(err),
                }
                if let Some(sealed) = SealedEntry::parse(&image, &self.layout) {
                    if sealed.matches(digest, routing_key) {
                        return Ok(Some((slot, sealed)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Metadata-only probe for an existing entry; the body is not read and
    /// nothing is decrypted.
    fn find_meta_slot(
        &self,
        digest: &[u8; DIGEST_LEN],
        routing_key: &[u8],
        capacity: u64,
        previous: u64,
    ) -> io::Result<Option<u64>> {
        let mut meta = [0u8; METADATA_LEN];
        for probe_capacity in std::iter::once(capacity).chain((previous != 0).then_some(previous)) {
            for slot in candidate_slots(digest, probe_capacity) {
                match self.shards.read_meta(slot, &mut meta) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => continue,
                    Err(err) => return Err(err),
                }
                if let Some(parsed) = EntryMeta::parse(&meta, &self.layout) {
                    if parsed.matches(digest, routing_key) {
                        return Ok(Some(slot));
                    }
                }
            }
        }
        Ok(None)
    }

    fn first_free_candidate(&self, candidates: &[u64; PROBE_DEPTH]) -> io::Result<Option<u64>> {
        let mut meta = [0u8; METADATA_LEN];
        for &slot in candidates {
            match self.shards.read_meta(slot, &mut meta) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => continue,
                Err(err) => return Err(err),
            }
            if EntryMeta::parse(&meta, &self.layout).is_none() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Opportunistically restamp or move a stale hit to a current-capacity
    /// candidate. Caller holds the lock-offset union; failures just leave
    /// the entry for the cleaner.
    fn promote(&self, slot: u64, mut sealed: SealedEntry, capacity: u64) {
        sealed.restamp(capacity);
        let candidates = candidate_slots(sealed.digest(), capacity);

        let result = if candidates.contains(&slot) {
            self.shards.write_meta(slot, &sealed.meta().encode())
        } else {
            let mut meta = [0u8; METADATA_LEN];
            let mut target = None;
            for candidate in candidates {
                if self.shards.read_meta(candidate, &mut meta).is_err() {
                    continue;
                }
                if EntryMeta::parse(&meta, &self.layout).is_none() {
                    target = Some(candidate);
                    break;
                }
            }
            let Some(target) = target else {
                return; // neighborhood full, the cleaner will deal with it
            };
            self.shards
                .write_entry(target, &sealed.to_bytes(&self.layout))
                .and_then(|()| self.shards.free_slot(slot))
        };

        if let Err(err) = result {
            debug!(
                target: "saltbox::store",
                store = %self.name,
                slot,
                error = %err,
                "stale entry promotion failed"
            );
        }
    }
}

/// A salted-hash persistent block store.
///
/// One logical table per block type: fixed capacity, per-slot locking,
/// bloom-gated lookups and an online background resize.
pub struct SaltedStore<C: BlockCodec> {
    inner: Arc<StoreInner<C>>,
    cleaner: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<C: BlockCodec> SaltedStore<C> {
    /// Open or create the store `name` under `base_dir`.
    ///
    /// An existing store adopts its persisted capacity and salt; if the
    /// requested `tuning.max_keys` differs, a resize toward it starts in
    /// the background. An interrupted resize leaves both table sizes
    /// readable and the migration resumes.
    pub fn open(
        base_dir: impl AsRef<Path>,
        name: &str,
        codec: C,
        tuning: StoreTuning,
    ) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;

        let layout = EntryLayout::new(
            codec.header_len(),
            codec.data_len(),
            codec.routing_key_len(),
        );
        let state_path = base_dir.join(format!("{name}.config"));

        let (salt, mut capacity, mut previous_capacity, key_count, fresh) =
            match StoreState::load(&state_path)? {
                Some(state) => (
                    state.salt,
                    state.capacity,
                    state.previous_capacity,
                    state.key_count,
                    false,
                ),
                None => {
                    let mut salt = [0u8; SALT_LEN];
                    rand::rng().fill_bytes(&mut salt);
                    (salt, tuning.max_keys, 0, 0, true)
                }
            };

        // A changed capacity request becomes a fresh resize once the store
        // is up; a request racing an interrupted resize first collapses to
        // the larger table so every entry stays reachable.
        let mut pending_resize = None;
        if tuning.max_keys != capacity {
            if previous_capacity != 0 {
                capacity = capacity.max(previous_capacity);
                previous_capacity = 0;
            }
            pending_resize = Some(tuning.max_keys);
        }

        let shards = ShardFiles::open(
            &base_dir,
            name,
            tuning.shard_count,
            layout.entry_size as u64,
            capacity.max(previous_capacity),
        )?;
        let bloom = BloomGate::open(
            base_dir.join(format!("{name}.bloom")),
            tuning.bloom_false_positive_rate,
            capacity as usize,
            fresh,
        );

        let inner = Arc::new(StoreInner {
            collision_possible: codec.collision_possible(),
            save_plain_key: codec.stores_plain_key(),
            codec,
            name: name.to_string(),
            layout,
            cipher: EntryCipher::new(salt),
            shards,
            locks: LockTable::new(),
            bloom,
            stats: StoreStats::new(),
            tuning,
            table: RwLock::new(TableState {
                capacity,
                previous_capacity,
            }),
            migration_lock: Mutex::new(()),
            cleaner_flag: Mutex::new(false),
            cleaner_wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            state_path,
            spool_path: base_dir.join(format!("{name}.spool")),
        });

        inner.stats.set_key_count(key_count);
        {
            let table = inner.table.read();
            inner.persist_state(&table)?;
        }

        let store = Self {
            inner: Arc::clone(&inner),
            cleaner: Mutex::new(None),
        };

        if let Some(target) = pending_resize {
            store.resize(target, false)?;
        }

        let handle = thread::Builder::new()
            .name(format!("saltbox-cleaner-{name}"))
            .spawn({
                let inner = Arc::clone(&inner);
                move || cleaner::cleaner_loop(inner)
            })?;
        *store.cleaner.lock() = Some(handle);

        if inner.table.read().previous_capacity != 0 || inner.bloom.needs_rebuild() {
            inner.wake_cleaner();
        }

        info!(
            target: "saltbox::store",
            store = name,
            capacity = inner.table.read().capacity,
            key_count,
            "store opened"
        );
        Ok(store)
    }

    /// Look up a block by routing key.
    ///
    /// `Ok(None)` is a miss; a stored entry that fails digest or semantic
    /// verification is also a miss (and its slot is freed so it stops
    /// returning garbage). With `allow_stale_promote`, a hit that still
    /// carries a pre-resize capacity stamp is opportunistically restamped
    /// or moved to a current-capacity slot while its locks are held.
    pub fn fetch(
        &self,
        routing_key: &[u8],
        full_key: Option<&[u8]>,
        allow_stale_promote: bool,
    ) -> Result<Option<C::Block>, StoreError> {
        let inner = &*self.inner;
        if routing_key.len() != inner.layout.routing_key_len {
            return Err(StoreError::InvalidLength {
                what: "routing key",
                expected: inner.layout.routing_key_len,
                got: routing_key.len(),
            });
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(StoreError::ShuttingDown);
        }

        let table = inner.table.read();
        let (capacity, previous) = (table.capacity, table.previous_capacity);
        let digest = inner.cipher.digest(routing_key);

        let gated = inner.bloom.is_active();
        if gated && !inner.bloom.maybe_present(&digest) {
            inner.stats.record_miss();
            return Ok(None);
        }

        let offsets = lock_offsets(&digest, capacity, previous);
        let Some(_guards) = inner.locks.lock_set(&offsets) else {
            return Err(StoreError::ShuttingDown);
        };

        let Some((slot, sealed)) = inner.find_sealed(&digest, routing_key, capacity, previous)?
        else {
            inner.stats.record_miss();
            if gated {
                inner.stats.record_bloom_false_positive();
            }
            return Ok(None);
        };

        let Some((header, data)) = sealed.open(&inner.cipher, &inner.layout, routing_key) else {
            inner.stats.record_miss();
            return Ok(None);
        };

        let verified = match inner
            .codec
            .construct(&data, &header, Some(routing_key), full_key)
        {
            Ok(block) if inner.codec.routing_key_of(&block) == routing_key => Some(block),
            _ => None,
        };
        let Some(block) = verified else {
            // either ciphertext corruption or a digest collision; the slot
            // would keep failing, so reclaim it
            warn!(
                target: "saltbox::store",
                store = %inner.name,
                slot,
                "stored entry failed verification, freeing slot"
            );
            if inner.shards.free_slot(slot).is_ok() {
                inner.stats.dec_key_count();
            }
            inner.stats.record_miss();
            return Ok(None);
        };

        if allow_stale_promote && sealed.capacity_stamp() != capacity {
            inner.promote(slot, sealed, capacity);
        }
        inner.stats.record_hit();
        Ok(Some(block))
    }

    /// Store a block.
    ///
    /// An identical entry already present is a successful no-op. For a
    /// collision-admitting block type, a different stored value raises
    /// [`StoreError::Collision`] unless `overwrite` is set. On a probe
    /// neighborhood fully occupied by unrelated keys, the primary
    /// candidate slot is overwritten unconditionally; this is a documented
    /// eviction policy, not LRU.
    pub fn put(
        &self,
        block: &C::Block,
        data: &[u8],
        header: &[u8],
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let inner = &*self.inner;
        if data.len() != inner.layout.data_len {
            return Err(StoreError::InvalidLength {
                what: "data",
                expected: inner.layout.data_len,
                got: data.len(),
            });
        }
        if header.len() != inner.layout.header_len {
            return Err(StoreError::InvalidLength {
                what: "header",
                expected: inner.layout.header_len,
                got: header.len(),
            });
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(StoreError::ShuttingDown);
        }

        let routing_key = inner.codec.routing_key_of(block);
        if routing_key.len() != inner.layout.routing_key_len {
            return Err(StoreError::InvalidLength {
                what: "routing key",
                expected: inner.layout.routing_key_len,
                got: routing_key.len(),
            });
        }

        let table = inner.table.read();
        let (capacity, previous) = (table.capacity, table.previous_capacity);
        let digest = inner.cipher.digest(&routing_key);

        let offsets = lock_offsets(&digest, capacity, previous);
        let Some(_guards) = inner.locks.lock_set(&offsets) else {
            return Err(StoreError::ShuttingDown);
        };

        // lazy probe: metadata only, no body read, no decryption; the gate
        // has no false negatives, so "absent" skips the probe entirely
        let existing = if inner.bloom.maybe_present(&digest) {
            inner.find_meta_slot(&digest, &routing_key, capacity, previous)?
        } else {
            None
        };

        let candidates = candidate_slots(&digest, capacity);

        if let Some(slot) = existing {
            if !inner.collision_possible {
                // self-verifying content: same digest, same block
                return Ok(());
            }

            let mut image = vec![0u8; inner.layout.entry_size];
            inner.shards.read_entry(slot, &mut image)?;
            if let Some(old) = SealedEntry::parse(&image, &inner.layout) {
                if let Some((old_header, old_data)) =
                    old.open(&inner.cipher, &inner.layout, &routing_key)
                {
                    match inner
                        .codec
                        .construct(&old_data, &old_header, Some(&routing_key), None)
                    {
                        Ok(old_block) if old_block == *block => return Ok(()), // already stored
                        Ok(_) if !overwrite => return Err(StoreError::Collision),
                        // a different value with permission, or stored
                        // garbage: overwrite below
                        _ => {}
                    }
                }
            }

            let sealed = SealedEntry::seal(
                &inner.cipher,
                &inner.layout,
                &routing_key,
                header,
                data,
                capacity,
                inner.save_plain_key,
            );
            if candidates.contains(&slot) {
                inner.shards.write_entry(slot, &sealed.to_bytes(&inner.layout))?;
            } else {
                // found at a previous-capacity-only address: rewrite at a
                // current candidate so the end of migration cannot strand
                // a freshly stamped entry, and free the old slot
                let target = inner.first_free_candidate(&candidates)?.unwrap_or(candidates[0]);
                inner
                    .shards
                    .write_entry(target, &sealed.to_bytes(&inner.layout))?;
                inner.shards.free_slot(slot)?;
            }
            inner.bloom.record(&digest);
            inner.stats.record_write();
            return Ok(());
        }

        let sealed = SealedEntry::seal(
            &inner.cipher,
            &inner.layout,
            &routing_key,
            header,
            data,
            capacity,
            inner.save_plain_key,
        );
        let image = sealed.to_bytes(&inner.layout);

        if let Some(slot) = inner.first_free_candidate(&candidates)? {
            inner.shards.write_entry(slot, &image)?;
            inner.bloom.record(&digest);
            inner.stats.record_write();
            inner.stats.inc_key_count();
            return Ok(());
        }

        // neighborhood saturated: last write wins at the primary position
        debug!(
            target: "saltbox::store",
            store = %inner.name,
            slot = candidates[0],
            "probe neighborhood full, overwriting primary slot"
        );
        inner.shards.write_entry(candidates[0], &image)?;
        inner.bloom.record(&digest);
        inner.stats.record_write();
        Ok(())
    }

    /// Request a capacity change.
    ///
    /// The new capacity is recorded durably at once; entry migration runs
    /// in the background, or on this thread when `shrink_now` is set. A
    /// request arriving while a migration is already in flight is ignored.
    pub fn resize(&self, new_capacity: u64, shrink_now: bool) -> Result<(), StoreError> {
        let inner = &*self.inner;
        let new_capacity = new_capacity.max(1);
        {
            let mut table = inner.table.write();
            if new_capacity == table.capacity {
                return Ok(());
            }
            if table.previous_capacity != 0 {
                info!(
                    target: "saltbox::store",
                    store = %inner.name,
                    "resize already in progress, ignoring request"
                );
                return Ok(());
            }
            info!(
                target: "saltbox::store",
                store = %inner.name,
                old_capacity = table.capacity,
                new_capacity,
                "table resize requested"
            );
            table.previous_capacity = table.capacity;
            table.capacity = new_capacity;
            if new_capacity > table.previous_capacity {
                inner.shards.ensure_slots(new_capacity)?;
            }
            inner.persist_state(&table)?;
        }

        if shrink_now {
            let _pass = inner.migration_lock.lock();
            cleaner::run_migration(inner);
        } else {
            inner.wake_cleaner();
        }
        Ok(())
    }

    /// Current operation counters.
    pub fn stats(&self) -> Snapshot {
        self.inner.stats.snapshot()
    }

    /// Current table capacity in slots.
    pub fn capacity(&self) -> u64 {
        self.inner.table.read().capacity
    }

    /// Whether a resize migration is in flight.
    pub fn is_resizing(&self) -> bool {
        self.inner.table.read().previous_capacity != 0
    }

    /// Shut the store down: stop the cleaner, drain in-flight operations,
    /// flush everything. Subsequent operations fail with
    /// [`StoreError::ShuttingDown`]. Also runs on drop.
    pub fn close(&self) {
        let inner = &*self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "saltbox::store", store = %inner.name, "store closing");

        inner.locks.shutdown();
        inner.wake_cleaner();
        if let Some(handle) = self.cleaner.lock().take() {
            let _ = handle.join();
        }

        if !inner.locks.lock_global(SHUTDOWN_DRAIN_TIMEOUT) {
            warn!(
                target: "saltbox::store",
                store = %inner.name,
                "slot locks did not drain in time, flushing anyway"
            );
        }

        let table = inner.table.write();
        if let Err(err) = inner.shards.flush() {
            warn!(target: "saltbox::store", store = %inner.name, error = %err, "data flush failed on close");
        }
        if let Err(err) = inner.bloom.persist() {
            warn!(target: "saltbox::store", store = %inner.name, error = %err, "bloom snapshot write failed on close");
        }
        if let Err(err) = inner.persist_state(&table) {
            warn!(target: "saltbox::store", store = %inner.name, error = %err, "state write failed on close");
        }
    }
}

impl<C: BlockCodec> Drop for SaltedStore<C> {
    fn drop(&mut self) {
        self.close();
    }
}
