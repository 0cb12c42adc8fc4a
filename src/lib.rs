//! saltbox - salted-hash persistent block store
//!
//! The on-disk table behind a content-addressed distributed storage node:
//! a fixed-capacity key/block store that survives restarts, serves
//! concurrent lookups and insertions from many threads, and can be grown
//! or shrunk online without taking the node down.
//!
//! # Design
//!
//! - **Index-less placement**: each key probes a short slot sequence
//!   derived from its salted digest; there is no separate index structure
//!   to maintain or recover.
//! - **Self-keyed entries**: every entry is encrypted under a key derived
//!   from its own routing key, so disk contents are useless without the
//!   keys that address them.
//! - **Bloom-gated lookups**: definite misses never touch disk.
//! - **Online resize**: a background cleaner migrates entries between the
//!   old and new table sizes while the store keeps serving traffic, with
//!   bounded effort and documented data-loss semantics on shrink.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use saltbox::{SaltedStore, StoreTuning};
//!
//! let store = SaltedStore::open(dir, "chk", codec, StoreTuning::new(1 << 20))?;
//! store.put(&block, &data, &header, false)?;
//! let found = store.fetch(&routing_key, None, false)?;
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod block;
mod bloom;
mod cipher;
mod cleaner;
pub mod config;
mod entry;
pub mod error;
mod lock;
pub mod placement;
mod shard;
mod spool;
pub mod stats;
pub mod store;

// Re-exports for convenience
pub use block::{BlockCodec, VerifyError};
pub use config::StoreTuning;
pub use error::StoreError;
pub use stats::Snapshot;
pub use store::SaltedStore;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::block::{BlockCodec, VerifyError};
    pub use crate::config::StoreTuning;
    pub use crate::error::StoreError;
    pub use crate::stats::Snapshot;
    pub use crate::store::SaltedStore;
}
