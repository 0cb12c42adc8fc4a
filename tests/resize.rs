//! Online resize: growing, shrinking, probing both table sizes mid-flight.

mod common;

use std::time::Duration;

use common::{quiet_tuning, wait_until, ContentBlock, ContentCodec};
use saltbox::{SaltedStore, StoreTuning};

/// Insert `count` seeded blocks and return those that survived capacity
/// pressure (a saturated probe neighborhood evicts, by design).
fn insert_blocks(store: &SaltedStore<ContentCodec>, count: u64) -> Vec<ContentBlock> {
    let blocks: Vec<ContentBlock> = (0..count).map(ContentBlock::from_seed).collect();
    for block in &blocks {
        store.put(block, &block.data, &block.header, false).unwrap();
    }
    blocks
        .into_iter()
        .filter(|block| {
            store
                .fetch(&block.routing_key(), None, false)
                .unwrap()
                .is_some()
        })
        .collect()
}

fn assert_all_present(store: &SaltedStore<ContentCodec>, blocks: &[ContentBlock]) {
    for block in blocks {
        let found = store.fetch(&block.routing_key(), None, false).unwrap();
        assert_eq!(found.as_ref(), Some(block), "entry lost or changed by resize");
    }
}

#[test]
fn test_grow_preserves_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(16)).unwrap();

    let survivors = insert_blocks(&store, 10);
    assert!(!survivors.is_empty());

    store.resize(64, true).unwrap();
    assert_eq!(store.capacity(), 64);
    assert!(!store.is_resizing(), "synchronous resize must complete");

    assert_all_present(&store, &survivors);
}

#[test]
fn test_shrink_preserves_surviving_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(64)).unwrap();

    let survivors = insert_blocks(&store, 10);

    store.resize(16, true).unwrap();
    assert_eq!(store.capacity(), 16);
    assert!(!store.is_resizing());

    // a bounded-effort shrink may drop entries, but whatever is still
    // retrievable must be byte-identical
    let mut kept = 0;
    for block in &survivors {
        if let Some(found) = store.fetch(&block.routing_key(), None, false).unwrap() {
            assert_eq!(&found, block);
            kept += 1;
        }
    }
    assert!(kept > 0, "a 10-entry table shrunk to 16 slots kept nothing");
}

#[test]
fn test_grow_then_shrink_back_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(32)).unwrap();

    let survivors = insert_blocks(&store, 12);

    store.resize(128, true).unwrap();
    assert_all_present(&store, &survivors);

    store.resize(32, true).unwrap();
    assert_eq!(store.capacity(), 32);

    // back at the original size every entry fits again; only capacity
    // pressure during the shrink itself can evict, and 12 entries in 32
    // slots leave plenty of room, so expect everything back
    let kept: Vec<_> = survivors
        .iter()
        .filter(|block| {
            store
                .fetch(&block.routing_key(), None, false)
                .unwrap()
                .is_some()
        })
        .collect();
    assert!(
        kept.len() >= survivors.len().saturating_sub(2),
        "shrink back to original size dropped {} of {} entries",
        survivors.len() - kept.len(),
        survivors.len()
    );
}

#[test]
fn test_shrink_truncates_data_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(1024)).unwrap();
    insert_blocks(&store, 8);

    let size_before: u64 = data_file_bytes(dir.path());
    store.resize(64, true).unwrap();
    let size_after: u64 = data_file_bytes(dir.path());

    assert!(
        size_after < size_before,
        "shrink must release file space ({size_before} -> {size_after})"
    );
}

#[test]
fn test_fetch_during_migration_probes_both_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(32)).unwrap();

    let survivors = insert_blocks(&store, 10);

    // background resize: entries may still sit at old-capacity addresses
    // while the cleaner works; every fetch must see them regardless
    store.resize(128, false).unwrap();
    assert_all_present(&store, &survivors);

    assert!(
        wait_until(Duration::from_secs(10), || !store.is_resizing()),
        "background migration did not finish"
    );
    assert_all_present(&store, &survivors);
}

#[test]
fn test_stale_promote_during_migration() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(32)).unwrap();

    let survivors = insert_blocks(&store, 10);
    store.resize(128, false).unwrap();

    // promote-on-fetch and the cleaner race benignly; either way every
    // entry stays reachable with unchanged content
    for block in &survivors {
        let found = store.fetch(&block.routing_key(), None, true).unwrap();
        assert_eq!(found.as_ref(), Some(block));
    }
    wait_until(Duration::from_secs(10), || !store.is_resizing());
    assert_all_present(&store, &survivors);
}

#[test]
fn test_resize_to_same_capacity_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, quiet_tuning(64)).unwrap();

    store.resize(64, true).unwrap();
    assert_eq!(store.capacity(), 64);
    assert!(!store.is_resizing());
}

#[test]
fn test_background_resize_with_short_period() {
    let dir = tempfile::tempdir().unwrap();
    let tuning = StoreTuning::new(16).with_cleaner_period(Duration::from_millis(50));
    let store = SaltedStore::open(dir.path(), "chk", ContentCodec, tuning).unwrap();

    let survivors = insert_blocks(&store, 8);
    store.resize(64, false).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || !store.is_resizing()),
        "cleaner never completed the migration"
    );
    assert_eq!(store.capacity(), 64);
    assert_all_present(&store, &survivors);
}

fn data_file_bytes(dir: &std::path::Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            name.contains(".data-").then(|| entry.metadata().unwrap().len())
        })
        .sum()
}
