//! # keyrelay
//!
//! A keyed publish/subscribe relay over WebSockets that remembers the last
//! value published to every key. Subscribers get that value back in the
//! subscription acknowledgement, then every later publish as it happens.
//! Subscribing to `_all_` receives every publish.
//!
//! ## Core Modules
//!
//! - `broker`: wire envelope, subscription registry and the engine that routes
//!   publishes and answers subscribes.
//! - `client`: a reconnecting subscriber client and the request/response
//!   gateway built on top of the same protocol.
//! - `config`: layered configuration (defaults, file, `KEYRELAY_*` env).
//! - `persistence`: the last-value store, on `sled` or in memory.
//! - `transport`: the WebSocket server feeding the broker.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
