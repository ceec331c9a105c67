//! Client side of the relay.
//!
//! - `session`: the subscriber state machine (heartbeat, watchdog, reconnect)
//! - `runtime`: the tokio task that drives a session over a real WebSocket
//! - `gateway`: one-shot request/response and publish calls

pub mod gateway;
pub mod runtime;
pub mod session;

pub use gateway::{Gateway, key_from_path};
pub use runtime::{ClientHandle, ClientOptions, SubscriberClient};
pub use session::{ClientEvent, Session, SessionState, Status};

#[cfg(test)]
mod tests;
