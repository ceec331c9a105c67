//! Subscription registry
//!
//! Tracks which connection is subscribed to which key, indexed both ways:
//! `key -> connections` for fan-out and `connection -> keys` so dropping a
//! connection costs O(its own subscriptions), not O(all subscriptions).
//!
//! The wildcard key `_all_` is stored like any other key. `subscribers_of`
//! folds its subscribers into every lookup, so the match rule stays "exact
//! key or wildcard". Nothing reserves `_all_`; a data key with that name is
//! indistinguishable from the wildcard.
//!
//! Callers must synchronize access (the broker lock does this).

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::broker::connection::ConnectionId;

/// Subscribing to this key delivers every publish, whatever its key.
pub const WILDCARD_KEY: &str = "_all_";

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_key: HashMap<String, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to `key`, replacing any existing subscription
    /// for the same pair.
    pub fn add(&mut self, connection: ConnectionId, key: &str) {
        self.remove_one(connection, key);

        self.by_key
            .entry(key.to_string())
            .or_default()
            .insert(connection);
        self.by_connection
            .entry(connection)
            .or_default()
            .insert(key.to_string());
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn remove_one(&mut self, connection: ConnectionId, key: &str) -> bool {
        let removed = match self.by_key.get_mut(key) {
            Some(subscribers) => {
                let removed = subscribers.remove(&connection);
                if subscribers.is_empty() {
                    self.by_key.remove(key);
                }
                removed
            }
            None => false,
        };

        if let Some(keys) = self.by_connection.get_mut(&connection) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_connection.remove(&connection);
            }
        }

        removed
    }

    /// Drop every subscription held by `connection`; returns how many there were.
    pub fn remove_all(&mut self, connection: ConnectionId) -> usize {
        let Some(keys) = self.by_connection.remove(&connection) else {
            return 0;
        };

        for key in &keys {
            if let Some(subscribers) = self.by_key.get_mut(key) {
                subscribers.remove(&connection);
                if subscribers.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }

        keys.len()
    }

    /// Snapshot of the connections a publish to `key` must reach: exact
    /// subscribers plus wildcard subscribers, each at most once.
    pub fn subscribers_of(&self, key: &str) -> BTreeSet<ConnectionId> {
        [key, WILDCARD_KEY]
            .into_iter()
            .filter_map(|k| self.by_key.get(k))
            .flatten()
            .copied()
            .collect()
    }

    pub fn is_subscribed(&self, connection: ConnectionId, key: &str) -> bool {
        self.by_key
            .get(key)
            .is_some_and(|subscribers| subscribers.contains(&connection))
    }

    pub fn keys_of(&self, connection: ConnectionId) -> BTreeSet<String> {
        self.by_connection
            .get(&connection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.by_connection.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }
}
