//! Broker engine
//!
//! One method per transport event (`on_open`, `on_message`, `on_error`,
//! `on_close`). The engine owns the subscription registry and the
//! last-value store, and speaks the wire protocol:
//! - `ping` -> `pong`
//! - `subscribe` -> replace the subscription, reply `subscribeSuccess` with
//!   the cached envelope for the key
//! - `unsubscribe` -> drop the subscription, reply `unsubscribeSuccess`
//! - `publish` -> write the store first, then fan out to exact and wildcard
//!   subscribers
//!
//! Concurrency and usage notes:
//! - The API is synchronous and meant to sit behind one lock
//!   (`SharedBroker`). Every event is a single critical section, so registry
//!   and store never see concurrent mutation.
//! - Outbound messages go into per-connection unbounded channels; no socket
//!   I/O happens while the lock is held. The store call does run under the
//!   lock, so a slow store stalls every connection for its duration.
//! - Malformed or unknown messages are logged and dropped. They never close
//!   the connection.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::{Connection, ConnectionId};
use crate::broker::message::{Envelope, MessageType};
use crate::broker::registry::SubscriptionRegistry;
use crate::persistence::LastValueStore;
use crate::utils::error::ProtocolError;

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the shared broker. A panic in another holder leaves the maps
/// consistent (every mutation is a single insert/remove), so a poisoned lock
/// is recovered rather than propagated.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Broker {
    connections: HashMap<ConnectionId, Connection>,
    registry: SubscriptionRegistry,
    store: Box<dyn LastValueStore>,
    next_connection_id: u64,
}

impl Broker {
    pub fn new(store: impl LastValueStore + 'static) -> Self {
        Self {
            connections: HashMap::new(),
            registry: SubscriptionRegistry::new(),
            store: Box::new(store),
            next_connection_id: 1,
        }
    }

    pub fn into_shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn LastValueStore {
        self.store.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Register a freshly accepted connection and greet it with its id.
    pub fn on_open(&mut self, sender: UnboundedSender<WsMessage>) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        let connection = Connection::new(id, sender);
        Self::send(&connection, &Envelope::welcome(id));
        self.connections.insert(id, connection);

        info!("({id}) new connection");
        id
    }

    pub fn on_message(&mut self, id: ConnectionId, raw: &str) {
        if !self.connections.contains_key(&id) {
            warn!("({id}) message for unknown or closed connection dropped");
            return;
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "({id}) {e} | {}",
                    raw.chars().take(100).collect::<String>()
                );
                return;
            }
        };

        let result = match envelope.kind {
            MessageType::Ping => {
                self.on_ping(id);
                Ok(())
            }
            MessageType::Subscribe => self.on_subscribe(id, &envelope),
            MessageType::Unsubscribe => self.on_unsubscribe(id, &envelope),
            MessageType::Publish => self.on_publish(id, &envelope),
            _ => {
                warn!(
                    "({id}) unknown message: {}",
                    raw.chars().take(100).collect::<String>()
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("({id}) {e}");
        }
    }

    /// Log a transport error and force the connection closed.
    pub fn on_error(&mut self, id: ConnectionId, err: &dyn Display) {
        error!("({id}) error: {err}");
        if let Some(connection) = self.connections.get(&id) {
            connection.close();
        }
        self.on_close(id);
    }

    /// Forget the connection and all of its subscriptions. Safe to call more
    /// than once.
    pub fn on_close(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_none() {
            return;
        }
        let removed = self.registry.remove_all(id);
        info!("({id}) connection closed, {removed} subscription(s) removed");
    }

    fn on_ping(&self, id: ConnectionId) {
        debug!("({id}) ping");
        self.send_to(id, &Envelope::pong());
    }

    fn on_subscribe(&mut self, id: ConnectionId, envelope: &Envelope) -> Result<(), ProtocolError> {
        let key = envelope.require_key()?;
        info!("({id}) subscribe for key [{key}]");

        self.registry.add(id, key);

        let cached = match self.store.get(key) {
            Ok(cached) => cached,
            Err(e) => {
                error!("({id}) cache read for key [{key}] failed, treating as miss: {e}");
                None
            }
        };

        self.send_to(id, &Envelope::subscribe_success(id, key, cached));
        Ok(())
    }

    fn on_unsubscribe(
        &mut self,
        id: ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let key = envelope.require_key()?;
        info!("({id}) unsubscribe for key [{key}]");

        if !self.registry.remove_one(id, key) {
            debug!("({id}) was not subscribed to [{key}]");
        }

        self.send_to(id, &Envelope::unsubscribe_success(id, key));
        Ok(())
    }

    fn on_publish(&mut self, id: ConnectionId, envelope: &Envelope) -> Result<(), ProtocolError> {
        let key = envelope.require_key()?;
        envelope.require_value()?;
        info!("({id}) publish with key [{key}]");

        // Store before fan-out: a subscriber racing this publish either gets
        // the broadcast or finds the value in its subscribe ack.
        if let Err(e) = self.store.upsert(key, envelope) {
            error!("({id}) cache write for key [{key}] failed, forwarding anyway: {e}");
        }

        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("({id}) failed to serialize publish for [{key}]: {e}");
                return Ok(());
            }
        };
        let ws_msg = WsMessage::text(text);

        let subscribers = self.registry.subscribers_of(key);
        for sub_id in subscribers {
            match self.connections.get(&sub_id) {
                Some(connection) => {
                    if let Err(e) = connection.send(ws_msg.clone()) {
                        warn!("publish -> ({sub_id}) failed: {e}");
                    } else {
                        debug!("publish -> ({sub_id}) with key [{key}]");
                    }
                }
                None => warn!("no connection registered with id {sub_id}"),
            }
        }
        Ok(())
    }

    fn send_to(&self, id: ConnectionId, envelope: &Envelope) {
        match self.connections.get(&id) {
            Some(connection) => Self::send(connection, envelope),
            None => warn!("({id}) reply dropped, connection is gone"),
        }
    }

    fn send(connection: &Connection, envelope: &Envelope) {
        let msg = match envelope.to_ws_message() {
            Ok(msg) => msg,
            Err(e) => {
                error!("failed to serialize {}: {e}", envelope.kind.as_str());
                return;
            }
        };
        if let Err(e) = connection.send(msg) {
            warn!("({}) send failed: {e}", connection.id);
        }
    }

    /// Flush the store; called on shutdown.
    pub fn flush_store(&self) {
        if let Err(e) = self.store.flush() {
            error!("failed to flush last-value store: {e}");
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("connections", &self.connections.len())
            .field("registry", &self.registry)
            .field("next_connection_id", &self.next_connection_id)
            .finish()
    }
}
