//! Store tuning and persistent store-wide state.
//!
//! Tuning is an in-process builder struct; the persistent state is a small
//! fixed binary file:
//!
//! ```text
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |0|1|2|3|4|5|6|7|8|9|A|B|C|D|E|F|
//!   +----+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |0000|             Salt              |
//!   +----+---------------+---------------+
//!   |0010|   Capacity    | Prev Capacity |
//!   +----+---------------+---------------+
//!   |0020|   Key Count   |   Reserved    |
//!   +----+---------------+---------------+
//! ```
//!
//! Integers are big-endian. The file is always written to a temporary
//! sibling and renamed into place. A short or unreadable file is treated
//! as "no prior store": the engine starts fresh with a new salt, which
//! silently abandons all previously stored data and is therefore logged
//! loudly, never recovered from quietly.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use tracing::error;

use crate::cipher::SALT_LEN;

/// Serialized length of the state file.
const STATE_LEN: usize = SALT_LEN + 8 + 8 + 8 + 8;

/// In-process tuning for one store instance.
///
/// Everything here is advisory except `max_keys`, which is the capacity a
/// fresh store is created with (an existing store adopts its persisted
/// capacity and resizes toward `max_keys` in the background).
#[derive(Debug, Clone)]
pub struct StoreTuning {
    /// Requested slot count.
    pub max_keys: u64,
    /// Number of data files the table is spread over.
    pub shard_count: u32,
    /// Byte budget for the resize overflow spool.
    pub spool_budget: u64,
    /// How often the background cleaner wakes without being signalled.
    pub cleaner_period: Duration,
    /// Target false-positive rate for the bloom gate.
    pub bloom_false_positive_rate: f64,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            max_keys: 1 << 16,
            shard_count: 4,
            spool_budget: 256 * 1024 * 1024,
            cleaner_period: Duration::from_secs(5 * 60),
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl StoreTuning {
    /// Tuning with the given capacity and defaults for the rest.
    pub fn new(max_keys: u64) -> Self {
        Self {
            max_keys: max_keys.max(1),
            ..Self::default()
        }
    }

    /// Set the requested slot count.
    pub fn with_max_keys(mut self, max_keys: u64) -> Self {
        self.max_keys = max_keys.max(1);
        self
    }

    /// Set the number of data files.
    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    /// Set the overflow spool budget in bytes.
    pub fn with_spool_budget(mut self, bytes: u64) -> Self {
        self.spool_budget = bytes;
        self
    }

    /// Set the cleaner wake period.
    pub fn with_cleaner_period(mut self, period: Duration) -> Self {
        self.cleaner_period = period;
        self
    }

    /// Set the bloom gate's target false-positive rate.
    pub fn with_bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate.clamp(0.0001, 0.5);
        self
    }
}

/// The persisted store-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoreState {
    pub salt: [u8; SALT_LEN],
    pub capacity: u64,
    pub previous_capacity: u64,
    pub key_count: u64,
}

impl StoreState {
    /// Load the state file.
    ///
    /// `Ok(None)` means "no usable prior store": the file is missing, or it
    /// is short/corrupt — the latter is logged loudly because starting
    /// fresh abandons every existing entry.
    pub(crate) fn load(path: &Path) -> io::Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut buf = [0u8; STATE_LEN];
        if let Err(err) = file.read_exact(&mut buf) {
            error!(
                target: "saltbox::config",
                path = %path.display(),
                error = %err,
                "store config unreadable; starting a FRESH store, all prior entries are lost"
            );
            return Ok(None);
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[..SALT_LEN]);
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[SALT_LEN + i * 8..SALT_LEN + (i + 1) * 8]);
            u64::from_be_bytes(w)
        };

        let state = Self {
            salt,
            capacity: word(0),
            previous_capacity: word(1),
            key_count: word(2),
        };
        if state.capacity == 0 {
            error!(
                target: "saltbox::config",
                path = %path.display(),
                "store config has zero capacity; starting a FRESH store, all prior entries are lost"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Write the state file via a temporary sibling and an atomic rename.
    pub(crate) fn write(&self, path: &Path) -> io::Result<()> {
        let mut buf = [0u8; STATE_LEN];
        buf[..SALT_LEN].copy_from_slice(&self.salt);
        buf[SALT_LEN..SALT_LEN + 8].copy_from_slice(&self.capacity.to_be_bytes());
        buf[SALT_LEN + 8..SALT_LEN + 16].copy_from_slice(&self.previous_capacity.to_be_bytes());
        buf[SALT_LEN + 16..SALT_LEN + 24].copy_from_slice(&self.key_count.to_be_bytes());
        // last word stays reserved zeros

        let tmp = path.with_extension("config.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_defaults() {
        let tuning = StoreTuning::default();
        assert_eq!(tuning.shard_count, 4);
        assert_eq!(tuning.spool_budget, 256 * 1024 * 1024);
        assert_eq!(tuning.cleaner_period, Duration::from_secs(300));
    }

    #[test]
    fn test_tuning_builder_clamps() {
        let tuning = StoreTuning::new(0).with_shard_count(0);
        assert_eq!(tuning.max_keys, 1);
        assert_eq!(tuning.shard_count, 1);

        let tuning = StoreTuning::new(8).with_bloom_false_positive_rate(2.0);
        assert!(tuning.bloom_false_positive_rate <= 0.5);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.config");

        let state = StoreState {
            salt: [0x5Au8; SALT_LEN],
            capacity: 1024,
            previous_capacity: 512,
            key_count: 77,
        };
        state.write(&path).unwrap();

        let loaded = StoreState::load(&path).unwrap().expect("state present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StoreState::load(&dir.path().join("nope.config"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_short_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.config");
        fs::write(&path, [1u8; 10]).unwrap();
        assert!(StoreState::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_zero_capacity_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.config");
        let state = StoreState {
            salt: [1u8; SALT_LEN],
            capacity: 0,
            previous_capacity: 0,
            key_count: 0,
        };
        state.write(&path).unwrap();
        assert!(StoreState::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_rewrite_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.config");

        let mut state = StoreState {
            salt: [2u8; SALT_LEN],
            capacity: 100,
            previous_capacity: 0,
            key_count: 0,
        };
        state.write(&path).unwrap();
        state.capacity = 200;
        state.write(&path).unwrap();

        let loaded = StoreState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.capacity, 200);
        assert!(!path.with_extension("config.tmp").exists());
    }
}
