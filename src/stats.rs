//! Store operation counters.
//!
//! Plain atomics, shared by the data path and the cleaner; `key_count` is
//! an approximate live-entry count, maintained incrementally and corrected
//! whenever the cleaner rescans the table.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one store instance.
#[derive(Debug, Default)]
pub(crate) struct StoreStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub key_count: AtomicU64,
    pub bloom_false_positives: AtomicU64,
}

impl StoreStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bloom_false_positive(&self) {
        self.bloom_false_positives.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_key_count(&self) {
        self.key_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the live-entry estimate, saturating at zero.
    pub(crate) fn dec_key_count(&self) {
        let _ = self
            .key_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub(crate) fn set_key_count(&self, count: u64) {
        self.key_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            key_count: self.key_count.load(Ordering::Relaxed),
            bloom_false_positives: self.bloom_false_positives.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Successful fetches.
    pub hits: u64,
    /// Fetches that found nothing (including verification failures).
    pub misses: u64,
    /// Entries written.
    pub writes: u64,
    /// Approximate count of live entries.
    pub key_count: u64,
    /// Probes the bloom gate let through that found nothing on disk.
    pub bloom_false_positives: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = StoreStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_write();
        stats.record_bloom_false_positive();
        stats.inc_key_count();

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.key_count, 1);
        assert_eq!(snap.bloom_false_positives, 1);
    }

    #[test]
    fn test_key_count_saturates_at_zero() {
        let stats = StoreStats::new();
        stats.dec_key_count();
        assert_eq!(stats.snapshot().key_count, 0);

        stats.inc_key_count();
        stats.dec_key_count();
        stats.dec_key_count();
        assert_eq!(stats.snapshot().key_count, 0);
    }

    #[test]
    fn test_set_key_count_overrides() {
        let stats = StoreStats::new();
        stats.inc_key_count();
        stats.set_key_count(42);
        assert_eq!(stats.snapshot().key_count, 42);
    }
}
