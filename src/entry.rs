//! On-disk entry format.
//!
//! Each occupied slot holds one entry: a fixed 128-byte metadata block,
//! the encrypted header and data bodies, and zero padding up to the next
//! 512-byte boundary.
//!
//! ```text
//!        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!        |0|1|2|3|4|5|6|7|8|9|A|B|C|D|E|F|
//!   +----+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |0000|                               |
//!   +----+     Digested Routing Key      |
//!   |0010|                               |
//!   +----+-------------------------------+
//!   |0020|        Data Encrypt IV        |
//!   +----+---------------+---------------+
//!   |0030|     Flags     | Capacity Stamp|
//!   +----+---------------+---------------+
//!   |0040|       Plain Routing Key       |
//!   |0050|  (only if FLAG_PLAIN_KEY set) |
//!   +----+-------------------------------+
//!   |0060|            Reserved           |
//!   |0070|            Reserved           |
//!   +----+-------------------------------+
//!   |0080|        Encrypted Header       |
//!   | .. + - - - - - - - - - - - - - - - +
//!   | .. |         Encrypted Data        |
//!   +----+-------------------------------+
//!   |    |            Padding            |
//!   +----+-------------------------------+
//! ```
//!
//! All integers are big-endian. Reserved bytes are zero on write, ignored
//! on read. A free slot has all-zero metadata; freeing a slot only zeroes
//! the metadata region.

use rand::RngCore;

use crate::cipher::{EntryCipher, DIGEST_LEN, IV_LEN};

/// Length of the entry metadata block in bytes.
pub(crate) const METADATA_LEN: usize = 0x80;

/// Entries are padded up to a multiple of this many bytes.
pub(crate) const ENTRY_ALIGN: usize = 0x200;

/// Width of the plain-routing-key region inside metadata.
const PLAIN_KEY_REGION: usize = 0x20;

/// Slot is occupied.
const FLAG_OCCUPIED: u64 = 0x1;
/// Plaintext routing key is stored in metadata.
const FLAG_PLAIN_KEY: u64 = 0x2;

const OFF_IV: usize = DIGEST_LEN;
const OFF_FLAGS: usize = OFF_IV + IV_LEN;
const OFF_STAMP: usize = OFF_FLAGS + 8;
const OFF_PLAIN_KEY: usize = OFF_STAMP + 8;

/// Fixed per-store byte layout, derived from the block type's lengths.
#[derive(Debug, Clone)]
pub(crate) struct EntryLayout {
    pub header_len: usize,
    pub data_len: usize,
    pub routing_key_len: usize,
    /// Total slot width: metadata + bodies, padded to [`ENTRY_ALIGN`].
    pub entry_size: usize,
}

impl EntryLayout {
    pub(crate) fn new(header_len: usize, data_len: usize, routing_key_len: usize) -> Self {
        let raw = METADATA_LEN + header_len + data_len;
        Self {
            header_len,
            data_len,
            routing_key_len,
            entry_size: raw.div_ceil(ENTRY_ALIGN) * ENTRY_ALIGN,
        }
    }

    /// Whether this layout can carry the plaintext routing key inline.
    fn plain_key_fits(&self) -> bool {
        self.routing_key_len <= PLAIN_KEY_REGION
    }
}

/// Parsed metadata of an occupied slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    digest: [u8; DIGEST_LEN],
    iv: [u8; IV_LEN],
    flags: u64,
    capacity_stamp: u64,
    plain_key: Option<Vec<u8>>,
}

impl EntryMeta {
    /// Parse the metadata region of a slot. Returns `None` for a free slot.
    pub(crate) fn parse(buf: &[u8], layout: &EntryLayout) -> Option<Self> {
        debug_assert!(buf.len() >= METADATA_LEN);

        let flags = u64::from_be_bytes(buf[OFF_FLAGS..OFF_FLAGS + 8].try_into().ok()?);
        if flags & FLAG_OCCUPIED == 0 {
            return None;
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[..DIGEST_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&buf[OFF_IV..OFF_IV + IV_LEN]);
        let capacity_stamp = u64::from_be_bytes(buf[OFF_STAMP..OFF_STAMP + 8].try_into().ok()?);

        let plain_key = if flags & FLAG_PLAIN_KEY != 0 && layout.plain_key_fits() {
            Some(buf[OFF_PLAIN_KEY..OFF_PLAIN_KEY + layout.routing_key_len].to_vec())
        } else {
            None
        };

        Some(Self {
            digest,
            iv,
            flags,
            capacity_stamp,
            plain_key,
        })
    }

    /// Serialize into a fresh metadata block.
    pub(crate) fn encode(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        out[..DIGEST_LEN].copy_from_slice(&self.digest);
        out[OFF_IV..OFF_IV + IV_LEN].copy_from_slice(&self.iv);
        out[OFF_FLAGS..OFF_FLAGS + 8].copy_from_slice(&self.flags.to_be_bytes());
        out[OFF_STAMP..OFF_STAMP + 8].copy_from_slice(&self.capacity_stamp.to_be_bytes());
        if let Some(key) = &self.plain_key {
            out[OFF_PLAIN_KEY..OFF_PLAIN_KEY + key.len()].copy_from_slice(key);
        }
        out
    }

    /// Whether this entry belongs to the given key.
    ///
    /// Compares the stored plaintext key when present (no hashing needed),
    /// the stored digest otherwise.
    pub(crate) fn matches(&self, digest: &[u8; DIGEST_LEN], routing_key: &[u8]) -> bool {
        match &self.plain_key {
            Some(stored) => stored == routing_key,
            None => &self.digest == digest,
        }
    }

    pub(crate) fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    pub(crate) fn capacity_stamp(&self) -> u64 {
        self.capacity_stamp
    }

    /// Record the table capacity this entry is placed under.
    pub(crate) fn restamp(&mut self, capacity: u64) {
        self.capacity_stamp = capacity;
    }
}

/// A complete entry in its on-disk (encrypted) form.
///
/// The body stays ciphertext throughout: the resize pass relocates entries
/// between slots without ever holding their keys, so it moves sealed bytes
/// verbatim and only rewrites the metadata stamp.
#[derive(Debug, Clone)]
pub(crate) struct SealedEntry {
    meta: EntryMeta,
    /// Encrypted header followed by encrypted data.
    body: Vec<u8>,
}

impl SealedEntry {
    /// Encrypt and seal a new entry.
    ///
    /// A fresh IV is drawn on every call, so re-sealing the same plaintext
    /// never produces the same ciphertext.
    pub(crate) fn seal(
        cipher: &EntryCipher,
        layout: &EntryLayout,
        routing_key: &[u8],
        header: &[u8],
        data: &[u8],
        capacity_stamp: u64,
        save_plain_key: bool,
    ) -> Self {
        debug_assert_eq!(header.len(), layout.header_len);
        debug_assert_eq!(data.len(), layout.data_len);

        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut body = Vec::with_capacity(layout.header_len + layout.data_len);
        body.extend_from_slice(header);
        body.extend_from_slice(data);
        cipher.encrypt(&iv, routing_key, &mut body);

        let mut flags = FLAG_OCCUPIED;
        let plain_key = if save_plain_key && layout.plain_key_fits() {
            flags |= FLAG_PLAIN_KEY;
            Some(routing_key.to_vec())
        } else {
            None
        };

        Self {
            meta: EntryMeta {
                digest: cipher.digest(routing_key),
                iv,
                flags,
                capacity_stamp,
                plain_key,
            },
            body,
        }
    }

    /// Parse a full slot. Returns `None` for a free slot.
    pub(crate) fn parse(buf: &[u8], layout: &EntryLayout) -> Option<Self> {
        if buf.len() < layout.entry_size {
            return None;
        }
        let meta = EntryMeta::parse(buf, layout)?;
        let body = buf[METADATA_LEN..METADATA_LEN + layout.header_len + layout.data_len].to_vec();
        Some(Self { meta, body })
    }

    /// Serialize to a full padded slot image.
    pub(crate) fn to_bytes(&self, layout: &EntryLayout) -> Vec<u8> {
        let mut out = vec![0u8; layout.entry_size];
        out[..METADATA_LEN].copy_from_slice(&self.meta.encode());
        out[METADATA_LEN..METADATA_LEN + self.body.len()].copy_from_slice(&self.body);
        out
    }

    pub(crate) fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    pub(crate) fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.meta.digest
    }

    pub(crate) fn capacity_stamp(&self) -> u64 {
        self.meta.capacity_stamp
    }

    /// Record the table capacity this entry is placed under. The body is
    /// untouched; only metadata needs rewriting afterwards.
    pub(crate) fn restamp(&mut self, capacity: u64) {
        self.meta.capacity_stamp = capacity;
    }

    /// Whether this entry belongs to the given key. See [`EntryMeta::matches`].
    pub(crate) fn matches(&self, digest: &[u8; DIGEST_LEN], routing_key: &[u8]) -> bool {
        self.meta.matches(digest, routing_key)
    }

    /// Decrypt the body with the presented key, returning `(header, data)`.
    ///
    /// Returns `None` when the key does not match the stored digest; the
    /// ciphertext is never touched in that case.
    pub(crate) fn open(
        &self,
        cipher: &EntryCipher,
        layout: &EntryLayout,
        routing_key: &[u8],
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let digest = cipher.digest(routing_key);
        if !self.matches(&digest, routing_key) {
            return None;
        }
        let mut body = self.body.clone();
        cipher.decrypt(&self.meta.iv, routing_key, &mut body);
        let data = body.split_off(layout.header_len);
        Some((body, data))
    }
}
