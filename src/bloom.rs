//! Bloom-filter fast-reject gate for lookups.
//!
//! A negative answer is definitive and skips all disk probing; a positive
//! answer only means "maybe present". The gate must never produce a false
//! negative for a key that was recorded and not since evicted, or live data
//! becomes silently unreachable. When the snapshot file is missing or
//! unreadable the gate runs pass-through (every lookup probes disk) until
//! the cleaner has rebuilt it from the table.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use bincode::Options;
use growable_bloom_filter::GrowableBloom;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cipher::DIGEST_LEN;

/// Upper bound on a bloom snapshot accepted from disk. A corrupt file can
/// otherwise make bincode read a bogus length prefix and attempt an
/// unbounded allocation, aborting the process instead of reporting the
/// error; bounding the read turns that into the pass-through path below.
const MAX_SNAPSHOT_BYTES: u64 = 1 << 30;

/// Membership gate over digested routing keys.
pub(crate) struct BloomGate {
    /// The live filter; `None` while a rebuild is owed (pass-through mode).
    filter: RwLock<Option<GrowableBloom>>,
    /// Filter under construction during a rebuild. Normal puts record into
    /// both, so no insert is lost while the scan runs.
    staging: Mutex<Option<GrowableBloom>>,
    needs_rebuild: AtomicBool,
    path: PathBuf,
    false_positive_rate: f64,
}

impl BloomGate {
    /// Load the snapshot at `path`, or start pass-through if it is missing
    /// or unreadable.
    ///
    /// A `fresh_store` (one with no prior on-disk state at all) starts with
    /// an empty active filter instead: there is nothing to rebuild from.
    pub(crate) fn open(
        path: PathBuf,
        false_positive_rate: f64,
        expected_keys: usize,
        fresh_store: bool,
    ) -> Self {
        if fresh_store {
            return Self {
                needs_rebuild: AtomicBool::new(false),
                filter: RwLock::new(Some(GrowableBloom::new(
                    false_positive_rate,
                    expected_keys.max(1),
                ))),
                staging: Mutex::new(None),
                path,
                false_positive_rate,
            };
        }

        let filter = match File::open(&path) {
            Ok(file) => match bincode::DefaultOptions::new()
                .with_fixint_encoding()
                .allow_trailing_bytes()
                .with_limit(MAX_SNAPSHOT_BYTES)
                .deserialize_from(BufReader::new(file))
            {
                Ok(filter) => Some(filter),
                Err(err) => {
                    warn!(
                        target: "saltbox::bloom",
                        path = %path.display(),
                        error = %err,
                        "bloom snapshot unreadable, lookups go to disk until rebuilt"
                    );
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    target: "saltbox::bloom",
                    path = %path.display(),
                    error = %err,
                    "cannot open bloom snapshot, lookups go to disk until rebuilt"
                );
                None
            }
        };

        Self {
            needs_rebuild: AtomicBool::new(filter.is_none()),
            filter: RwLock::new(filter),
            staging: Mutex::new(None),
            path,
            false_positive_rate,
        }
    }

    /// `false` means definitely absent; `true` means a disk probe is needed.
    pub(crate) fn maybe_present(&self, digest: &[u8; DIGEST_LEN]) -> bool {
        match self.filter.read().as_ref() {
            Some(filter) => filter.contains(digest),
            None => true,
        }
    }

    /// Whether negative answers are currently meaningful. While a rebuild
    /// is owed the gate passes everything through, and a probe miss says
    /// nothing about the filter's false-positive rate.
    pub(crate) fn is_active(&self) -> bool {
        self.filter.read().is_some()
    }

    /// Record a key on every successful put.
    pub(crate) fn record(&self, digest: &[u8; DIGEST_LEN]) {
        if let Some(filter) = self.filter.write().as_mut() {
            filter.insert(digest);
        }
        if let Some(staging) = self.staging.lock().as_mut() {
            staging.insert(digest);
        }
    }

    pub(crate) fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    /// Begin rebuilding into a staging filter sized for `expected_keys`.
    pub(crate) fn start_rebuild(&self, expected_keys: usize) {
        let fresh = GrowableBloom::new(self.false_positive_rate, expected_keys.max(1));
        *self.staging.lock() = Some(fresh);
    }

    /// Record a key found by the rebuild scan.
    pub(crate) fn record_staged(&self, digest: &[u8; DIGEST_LEN]) {
        if let Some(staging) = self.staging.lock().as_mut() {
            staging.insert(digest);
        }
    }

    /// Swap the completed staging filter in and leave pass-through mode.
    pub(crate) fn finish_rebuild(&self) {
        let staged = self.staging.lock().take();
        if let Some(staged) = staged {
            *self.filter.write() = Some(staged);
            self.needs_rebuild.store(false, Ordering::Release);
            info!(target: "saltbox::bloom", "bloom filter rebuilt, fast-reject path enabled");
        }
    }

    /// Discard a partial rebuild (shutdown or a resize starting mid-scan).
    pub(crate) fn abandon_rebuild(&self) {
        *self.staging.lock() = None;
    }

    /// Persist the live filter to its snapshot file. A no-op in
    /// pass-through mode.
    pub(crate) fn persist(&self) -> io::Result<()> {
        let filter = self.filter.read();
        let Some(filter) = filter.as_ref() else {
            return Ok(());
        };
        let file = File::create(&self.path)?;
        bincode::serialize_into(BufWriter::new(file), filter)
            .map_err(|err| io::Error::other(format!("bloom snapshot serialize: {err}")))?;
        Ok(())
    }
}
