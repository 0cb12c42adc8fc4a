//! Digest-based slot placement.
//!
//! Every key probes a short, deterministic sequence of candidate slots
//! derived from its digest alone, independent of insertion order. The
//! quadratic spread constants are frozen compatibility values: any two
//! implementations sharing on-disk data must compute identical sequences,
//! so they are exposed as constants and never re-derived.

use crate::cipher::DIGEST_LEN;

/// Number of candidate slots probed per key.
pub const PROBE_DEPTH: usize = 4;

/// Quadratic spread constant: `slot_i = h + A*i*i + B*i (mod capacity)`.
pub const SPREAD_A: u64 = 141;

/// Linear spread constant, see [`SPREAD_A`].
pub const SPREAD_B: u64 = 13;

/// The candidate slot sequence for a digested key in a table of
/// `capacity` slots.
///
/// The first eight digest bytes are the probe base; the sign bit is masked
/// off before the modulo so the sequence is stable across word widths.
pub fn candidate_slots(digest: &[u8; DIGEST_LEN], capacity: u64) -> [u64; PROBE_DEPTH] {
    debug_assert!(capacity > 0);

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let h = u64::from_be_bytes(prefix);

    let mut slots = [0u64; PROBE_DEPTH];
    for (i, slot) in slots.iter_mut().enumerate() {
        let i = i as u64;
        *slot = (h.wrapping_add(SPREAD_A * i * i + SPREAD_B * i) & (i64::MAX as u64)) % capacity;
    }
    slots
}

/// The sorted, deduplicated union of a key's candidate slots under the
/// current capacity and, mid-resize, the previous one.
///
/// This is the set a data-path operation locks before touching disk: a
/// sorted acquisition order keeps concurrent multi-slot lockers deadlock
/// free, and deduplication keeps the non-reentrant lock table from being
/// asked for the same slot twice.
pub fn lock_offsets(
    digest: &[u8; DIGEST_LEN],
    capacity: u64,
    previous_capacity: u64,
) -> Vec<u64> {
    let mut offsets = candidate_slots(digest, capacity).to_vec();
    if previous_capacity != 0 {
        offsets.extend(candidate_slots(digest, previous_capacity));
    }
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}
