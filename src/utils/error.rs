//! Error types for each layer of the relay.
//!
//! Protocol and store errors are logged by the broker and never reach a
//! peer. Gateway errors are the only ones surfaced to an external caller,
//! and they keep "timed out", "connection lost" and "send rejected" apart.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to (de)serialize cached envelope: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("'{kind}' message is missing required field '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("could not connect: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("connection closed before an answer arrived")]
    ConnectionClosed,

    #[error("send rejected: {0}")]
    Send(#[source] tungstenite::Error),

    #[error("no usable key at path '{0}'")]
    InvalidKeyPath(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
