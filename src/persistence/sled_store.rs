//! Last-value store backed by `sled`
//!
//! A single tree maps the key's UTF-8 bytes to the JSON encoding of the full
//! envelope. `insert` on an existing key replaces it, which is exactly the
//! upsert contract. sled flushes to disk on its own schedule; `flush` forces
//! it (the server does so on shutdown).

use std::path::Path;

use sled::{Db, Tree};
use tracing::debug;

use crate::broker::message::Envelope;
use crate::persistence::LastValueStore;
use crate::utils::error::StoreError;

const LAST_VALUES_TREE: &str = "last_values";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    last_values: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database removed when the last handle drops.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let last_values = db.open_tree(LAST_VALUES_TREE)?;
        Ok(Self { db, last_values })
    }

    pub fn len(&self) -> usize {
        self.last_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_values.is_empty()
    }
}

impl LastValueStore for SledStore {
    fn upsert(&self, key: &str, envelope: &Envelope) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(envelope)?;
        self.last_values.insert(key.as_bytes(), serialized)?;
        debug!("store saved key [{key}]");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Envelope>, StoreError> {
        let Some(raw) = self.last_values.get(key.as_bytes())? else {
            return Ok(None);
        };
        debug!("store read key [{key}]");
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("entries", &self.last_values.len())
            .finish()
    }
}
