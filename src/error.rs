//! Error types returned by store operations.

/// Errors surfaced by [`SaltedStore`](crate::store::SaltedStore) operations.
///
/// Verification failures are deliberately absent: a stored entry that fails
/// digest or semantic verification is reported as a miss, not an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure. Not retried internally; the caller decides
    /// whether to treat the store as degraded.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A put found a different value under an existing key for a
    /// collision-admitting block type, without permission to overwrite.
    /// No data was modified.
    #[error("key collision: a different value is already stored under this key")]
    Collision,
    /// The operation could not acquire its slot locks because the store is
    /// shutting down.
    #[error("store is shutting down")]
    ShuttingDown,
    /// A supplied buffer does not match the fixed length the block type
    /// declared for it.
    #[error("invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Which buffer was mis-sized.
        what: &'static str,
        /// The length the block type declares.
        expected: usize,
        /// The length actually supplied.
        got: usize,
    },
}
