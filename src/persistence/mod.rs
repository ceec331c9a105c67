//! The `persistence` module holds the last-value cache: for every key, the
//! most recent envelope published to it.
//!
//! This is a mirror of "whatever was last published", not a log. There is
//! no TTL, no size bound and no history. The durable backend uses `sled`;
//! the in-memory backend serves ephemeral deployments and tests.
//!
//! The broker calls the store from inside its critical section, so
//! implementations only need per-call atomicity of `upsert` and `get`.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::broker::message::Envelope;
use crate::utils::error::StoreError;

pub trait LastValueStore: Send + Sync {
    /// Replace the cached envelope for `key` unconditionally.
    fn upsert(&self, key: &str, envelope: &Envelope) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Envelope>, StoreError>;

    /// Push buffered writes to durable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
