//! The `broker` module is the server side of the relay: the wire envelope,
//! the per-connection handle, the subscription registry and the engine that
//! ties them to the last-value store.

pub mod connection;
pub mod engine;
pub mod message;
pub mod registry;

pub use connection::{Connection, ConnectionId};
pub use engine::{Broker, SharedBroker};
pub use message::{Envelope, MessageType};
pub use registry::{SubscriptionRegistry, WILDCARD_KEY};
