//! Shared test fixtures: block codecs small enough to exercise the store
//! without dragging in real network block types.

#![allow(dead_code)]

use saltbox::{BlockCodec, StoreTuning, VerifyError};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Data length used by both test codecs.
pub const DATA_LEN: usize = 128;
/// Header length used by both test codecs.
pub const HEADER_LEN: usize = 32;
/// Routing key length used by both test codecs.
pub const KEY_LEN: usize = 32;

/// Tuning with a quiet cleaner, so tests drive migrations explicitly.
pub fn quiet_tuning(max_keys: u64) -> StoreTuning {
    StoreTuning::new(max_keys).with_cleaner_period(Duration::from_secs(3600))
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

// ---------------------------------------------------------------------------
// Content-addressed codec: the routing key IS the hash of the data, so the
// content is self-verifying and collisions are impossible.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    pub data: Vec<u8>,
    pub header: Vec<u8>,
}

impl ContentBlock {
    /// A deterministic block whose bytes are derived from `seed`.
    pub fn from_seed(seed: u64) -> Self {
        let pad = sha256(&[b"data", &seed.to_be_bytes()]);
        let data = pad.iter().cycle().copied().take(DATA_LEN).collect();
        let header = sha256(&[b"header", &seed.to_be_bytes()]).to_vec();
        Self { data, header }
    }

    pub fn routing_key(&self) -> Vec<u8> {
        sha256(&[&self.data]).to_vec()
    }
}

pub struct ContentCodec;

impl BlockCodec for ContentCodec {
    type Block = ContentBlock;

    fn data_len(&self) -> usize {
        DATA_LEN
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn routing_key_len(&self) -> usize {
        KEY_LEN
    }

    fn full_key_len(&self) -> usize {
        KEY_LEN
    }

    fn collision_possible(&self) -> bool {
        false
    }

    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: Option<&[u8]>,
        _full_key: Option<&[u8]>,
    ) -> Result<Self::Block, VerifyError> {
        if let Some(key) = routing_key {
            if sha256(&[data]) != key[..] {
                return Err(VerifyError::new("content hash does not match routing key"));
            }
        }
        Ok(ContentBlock {
            data: data.to_vec(),
            header: header.to_vec(),
        })
    }

    fn routing_key_of(&self, block: &Self::Block) -> Vec<u8> {
        block.routing_key()
    }
}

/// A content codec that never stores plaintext keys, forcing the
/// digest-comparison path on every probe.
pub struct OpaqueContentCodec;

impl BlockCodec for OpaqueContentCodec {
    type Block = ContentBlock;

    fn data_len(&self) -> usize {
        DATA_LEN
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn routing_key_len(&self) -> usize {
        KEY_LEN
    }

    fn full_key_len(&self) -> usize {
        KEY_LEN
    }

    fn collision_possible(&self) -> bool {
        false
    }

    fn stores_plain_key(&self) -> bool {
        false
    }

    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: Option<&[u8]>,
        full_key: Option<&[u8]>,
    ) -> Result<Self::Block, VerifyError> {
        ContentCodec.construct(data, header, routing_key, full_key)
    }

    fn routing_key_of(&self, block: &Self::Block) -> Vec<u8> {
        block.routing_key()
    }
}

// ---------------------------------------------------------------------------
// Signed codec: the routing key names a mutable slot, the header carries a
// keyed hash standing in for a signature, and two different values may
// legitimately live under one key over time.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl SignedBlock {
    pub fn new(key_seed: u64, data_seed: u64) -> Self {
        let key = sha256(&[b"signed-key", &key_seed.to_be_bytes()]).to_vec();
        let pad = sha256(&[b"signed-data", &data_seed.to_be_bytes()]);
        let data = pad.iter().cycle().copied().take(DATA_LEN).collect();
        Self { key, data }
    }

    /// The header that makes this block verify.
    pub fn header(&self) -> Vec<u8> {
        sha256(&[&self.key, &self.data]).to_vec()
    }
}

pub struct SignedCodec;

impl BlockCodec for SignedCodec {
    type Block = SignedBlock;

    fn data_len(&self) -> usize {
        DATA_LEN
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn routing_key_len(&self) -> usize {
        KEY_LEN
    }

    fn full_key_len(&self) -> usize {
        KEY_LEN
    }

    fn collision_possible(&self) -> bool {
        true
    }

    fn construct_needs_key(&self) -> bool {
        true
    }

    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: Option<&[u8]>,
        _full_key: Option<&[u8]>,
    ) -> Result<Self::Block, VerifyError> {
        let key = routing_key.ok_or_else(|| VerifyError::new("routing key required"))?;
        if sha256(&[key, data]) != header[..] {
            return Err(VerifyError::new("signature check failed"));
        }
        Ok(SignedBlock {
            key: key.to_vec(),
            data: data.to_vec(),
        })
    }

    fn routing_key_of(&self, block: &Self::Block) -> Vec<u8> {
        block.key.clone()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
