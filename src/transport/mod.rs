//! The `transport` module is the network edge of the broker: it accepts
//! WebSocket connections and forwards their lifecycle events to the
//! `Broker`.

pub mod websocket;

pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
