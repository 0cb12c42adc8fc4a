//! The block-callback contract between the store and the block types it holds.
//!
//! The engine itself never interprets block contents. Each block type
//! (content-addressed, signed-subspace, key cache, ...) supplies a
//! [`BlockCodec`] that reconstructs and verifies typed blocks from the raw
//! header/data pair the store persists, and declares the fixed lengths the
//! on-disk entry format is sized from.

/// A stored entry decoded successfully but the reconstructed block failed
/// its own hash/signature verification.
///
/// The store treats this as a miss, never as a fatal error: two different
/// routing keys may legitimately collide on the stored digest, and a bit
/// flip in ciphertext decrypts to garbage that only this check can catch.
#[derive(Debug, thiserror::Error)]
#[error("block verification failed: {reason}")]
pub struct VerifyError {
    /// Human-readable cause, for logs only.
    pub reason: String,
}

impl VerifyError {
    /// Create a verification error with the given cause.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Reconstruction and verification callbacks for one block type.
///
/// One store instance holds exactly one codec; all lengths it reports must
/// stay fixed for the life of the on-disk store.
pub trait BlockCodec: Send + Sync + 'static {
    /// The typed block this codec produces.
    type Block: PartialEq + Send;

    /// Fixed length of the data block in bytes.
    fn data_len(&self) -> usize;

    /// Fixed length of the header block in bytes.
    fn header_len(&self) -> usize;

    /// Fixed length of the routing key in bytes.
    fn routing_key_len(&self) -> usize;

    /// Fixed length of the full key in bytes (0 if the type has none).
    fn full_key_len(&self) -> usize;

    /// Whether two distinct values may legitimately share one routing key.
    ///
    /// Content-addressed types return `false`: their content is
    /// self-verifying, so a digest match implies an identical block.
    /// Mutable signed key spaces return `true` and opt into the overwrite /
    /// collision-error handling of `put`.
    fn collision_possible(&self) -> bool;

    /// Whether the plaintext routing key should ride in entry metadata.
    ///
    /// Storing it lets lookups compare keys without hashing the candidate;
    /// types whose keys must not appear on disk in the clear return `false`.
    fn stores_plain_key(&self) -> bool {
        true
    }

    /// Whether [`construct`](Self::construct) needs the routing/full key to
    /// rebuild a block at all, or can work from header and data alone.
    fn construct_needs_key(&self) -> bool {
        false
    }

    /// Rebuild a typed block from raw stored bytes, verifying it.
    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: Option<&[u8]>,
        full_key: Option<&[u8]>,
    ) -> Result<Self::Block, VerifyError>;

    /// The routing key a block routes under.
    fn routing_key_of(&self, block: &Self::Block) -> Vec<u8>;
}
