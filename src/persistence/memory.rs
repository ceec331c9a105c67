//! In-memory last-value store. Not durable: everything is lost when the
//! process exits.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::broker::message::Envelope;
use crate::persistence::LastValueStore;
use crate::utils::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Envelope>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LastValueStore for MemoryStore {
    fn upsert(&self, key: &str, envelope: &Envelope) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), envelope.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Envelope>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}
