//! Sharded slot files.
//!
//! The table's slots are spread round-robin over a small fixed number of
//! data files purely to spread I/O: `shard = slot % shard_count`,
//! `region_offset = (slot / shard_count) * entry_size`. Slot contents are
//! only ever touched under that slot's lock, so the per-file mutex guards
//! nothing but the seek/read pair itself.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::entry::METADATA_LEN;

/// The fixed set of data files backing one store's slot table.
pub(crate) struct ShardFiles {
    files: Vec<Mutex<File>>,
    shard_count: u64,
    entry_size: u64,
}

impl ShardFiles {
    /// Open (creating as needed) `shard_count` data files under `base_dir`
    /// and extend them to hold `initial_slots` slots.
    pub(crate) fn open(
        base_dir: &Path,
        name: &str,
        shard_count: u32,
        entry_size: u64,
        initial_slots: u64,
    ) -> io::Result<Self> {
        let mut files = Vec::with_capacity(shard_count as usize);
        for i in 0..shard_count {
            let path = base_dir.join(format!("{name}.data-{i:03}"));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            files.push(Mutex::new(file));
        }

        let shards = Self {
            files,
            shard_count: u64::from(shard_count),
            entry_size,
        };
        shards.ensure_slots(initial_slots)?;
        Ok(shards)
    }

    /// Map a logical slot to its shard index and byte offset.
    fn locate(&self, slot: u64) -> (usize, u64) {
        let shard = (slot % self.shard_count) as usize;
        let offset = (slot / self.shard_count) * self.entry_size;
        (shard, offset)
    }

    /// Read one full slot. Fails with `UnexpectedEof` past the end of a
    /// shard, which callers treat as "no such slot" while a shrink is in
    /// flight.
    pub(crate) fn read_entry(&self, slot: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.entry_size as usize);
        let (shard, offset) = self.locate(slot);
        let mut file = self.files[shard].lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Read only the metadata region of a slot.
    pub(crate) fn read_meta(&self, slot: u64, buf: &mut [u8; METADATA_LEN]) -> io::Result<()> {
        let (shard, offset) = self.locate(slot);
        let mut file = self.files[shard].lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Write one full slot image.
    pub(crate) fn write_entry(&self, slot: u64, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.entry_size as usize);
        let (shard, offset) = self.locate(slot);
        let mut file = self.files[shard].lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    /// Rewrite only the metadata region of a slot, leaving the body bytes
    /// in place.
    pub(crate) fn write_meta(&self, slot: u64, meta: &[u8; METADATA_LEN]) -> io::Result<()> {
        let (shard, offset) = self.locate(slot);
        let mut file = self.files[shard].lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(meta)
    }

    /// Free a slot by zeroing its metadata.
    pub(crate) fn free_slot(&self, slot: u64) -> io::Result<()> {
        self.write_meta(slot, &[0u8; METADATA_LEN])
    }

    /// Grow the shard files to hold at least `slots` slots. Never shrinks.
    pub(crate) fn ensure_slots(&self, slots: u64) -> io::Result<()> {
        for (i, file) in self.files.iter().enumerate() {
            let needed = self.slots_in_shard(i as u64, slots) * self.entry_size;
            let file = file.lock();
            if file.metadata()?.len() < needed {
                file.set_len(needed)?;
            }
        }
        Ok(())
    }

    /// Truncate the shard files to exactly `slots` slots.
    pub(crate) fn truncate_slots(&self, slots: u64) -> io::Result<()> {
        for (i, file) in self.files.iter().enumerate() {
            let len = self.slots_in_shard(i as u64, slots) * self.entry_size;
            file.lock().set_len(len)?;
        }
        Ok(())
    }

    /// Flush every shard to stable storage.
    pub(crate) fn flush(&self) -> io::Result<()> {
        for file in &self.files {
            file.lock().sync_all()?;
        }
        Ok(())
    }

    /// How many of the first `slots` slots land in shard `shard`.
    fn slots_in_shard(&self, shard: u64, slots: u64) -> u64 {
        (slots + self.shard_count - 1 - shard) / self.shard_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_shards(dir: &Path, entry_size: u64, slots: u64) -> ShardFiles {
        ShardFiles::open(dir, "test", 4, entry_size, slots).unwrap()
    }

    #[test]
    fn test_slot_mapping_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let shards = open_shards(dir.path(), 512, 16);
        assert_eq!(shards.locate(0), (0, 0));
        assert_eq!(shards.locate(1), (1, 0));
        assert_eq!(shards.locate(4), (0, 512));
        assert_eq!(shards.locate(7), (3, 512));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let shards = open_shards(dir.path(), 512, 8);

        let image = vec![0xABu8; 512];
        shards.write_entry(5, &image).unwrap();

        let mut back = vec![0u8; 512];
        shards.read_entry(5, &mut back).unwrap();
        assert_eq!(back, image);

        // neighbors untouched
        shards.read_entry(4, &mut back).unwrap();
        assert_eq!(back, vec![0u8; 512]);
    }

    #[test]
    fn test_free_slot_zeroes_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let shards = open_shards(dir.path(), 512, 8);

        shards.write_entry(2, &vec![0xFFu8; 512]).unwrap();
        shards.free_slot(2).unwrap();

        let mut back = vec![0u8; 512];
        shards.read_entry(2, &mut back).unwrap();
        assert_eq!(&back[..METADATA_LEN], &[0u8; METADATA_LEN]);
        assert_eq!(&back[METADATA_LEN..], &vec![0xFFu8; 512 - METADATA_LEN][..]);
    }

    #[test]
    fn test_read_past_end_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let shards = open_shards(dir.path(), 512, 8);
        let mut buf = vec![0u8; 512];
        let err = shards.read_entry(100, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncate_then_grow() {
        let dir = tempfile::tempdir().unwrap();
        let shards = open_shards(dir.path(), 512, 16);

        shards.truncate_slots(4).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(shards.read_entry(8, &mut buf).is_err());

        shards.ensure_slots(16).unwrap();
        shards.read_entry(8, &mut buf).unwrap();
    }

    #[test]
    fn test_slots_in_shard_exact() {
        let dir = tempfile::tempdir().unwrap();
        let shards = open_shards(dir.path(), 512, 0);
        // 5 slots over 4 shards: shard 0 holds slots 0 and 4
        assert_eq!(shards.slots_in_shard(0, 5), 2);
        assert_eq!(shards.slots_in_shard(1, 5), 1);
        assert_eq!(shards.slots_in_shard(3, 5), 1);
        assert_eq!(shards.slots_in_shard(0, 0), 0);
    }
}
