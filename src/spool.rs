//! Bounded overflow spool for the resize pass.
//!
//! While a shrink is in flight, entries whose candidate slots are all
//! occupied can be parked in a temporary file instead of blocking a
//! migration round. The spool holds fixed-size sealed entry images, is
//! bounded by a byte budget, and lives only for the duration of one
//! migration; it is truncated after each drain and deleted when the
//! migration ends. Only the cleaner touches it, so it needs no locking.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Fixed-size entry spool backed by one temporary file.
pub(crate) struct OverflowSpool {
    path: PathBuf,
    file: Option<File>,
    entry_size: u64,
    /// Maximum number of entries the byte budget allows.
    budget_entries: u64,
    count: u64,
}

impl OverflowSpool {
    /// Create an empty spool. The backing file is created lazily on the
    /// first push.
    pub(crate) fn new(path: PathBuf, entry_size: u64, budget_bytes: u64) -> Self {
        Self {
            path,
            file: None,
            entry_size,
            budget_entries: budget_bytes / entry_size.max(1),
            count: 0,
        }
    }

    /// Park one sealed entry image. Returns `false` when the budget is
    /// exhausted; the entry is then left where it is for a later round.
    pub(crate) fn push(&mut self, image: &[u8]) -> io::Result<bool> {
        debug_assert_eq!(image.len() as u64, self.entry_size);
        if self.count >= self.budget_entries {
            return Ok(false);
        }

        if self.file.is_none() {
            self.file = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.path)?,
            );
        }
        let file = self.file.as_mut().expect("spool file just opened");
        file.seek(SeekFrom::Start(self.count * self.entry_size))?;
        file.write_all(image)?;
        self.count += 1;
        Ok(true)
    }

    /// Number of parked entries.
    pub(crate) fn len(&self) -> u64 {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Read back the `index`-th parked entry image.
    pub(crate) fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        debug_assert!(index < self.count);
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("spool read before any push"))?;
        let mut image = vec![0u8; self.entry_size as usize];
        file.seek(SeekFrom::Start(index * self.entry_size))?;
        file.read_exact(&mut image)?;
        Ok(image)
    }

    /// Empty the spool for the next round, keeping the file open.
    pub(crate) fn clear(&mut self) -> io::Result<()> {
        self.count = 0;
        if let Some(file) = &self.file {
            file.set_len(0)?;
        }
        Ok(())
    }

    /// Remove the backing file. Called when the migration ends.
    pub(crate) fn destroy(mut self) {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    target: "saltbox::cleaner",
                    path = %self.path.display(),
                    error = %err,
                    "could not remove overflow spool file"
                );
            }
        }
    }
}
