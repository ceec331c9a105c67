//! Connection handle
//!
//! `Connection` is the broker's non-owning view of a live WebSocket: its
//! broker-assigned id and the sending side of the per-connection channel the
//! transport drains into the socket. Dropping it does not close the socket;
//! `close` asks the writer task to do so.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::error::SendError;
use tungstenite::protocol::Message as WsMessage;

/// Broker-assigned connection identity. Monotonic, never reused while the
/// process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    sender: UnboundedSender<WsMessage>,
}

impl Connection {
    pub fn new(id: ConnectionId, sender: UnboundedSender<WsMessage>) -> Self {
        Self { id, sender }
    }

    pub fn send(&self, msg: WsMessage) -> Result<(), SendError<WsMessage>> {
        self.sender.send(msg)
    }

    /// Queue a close frame; the writer task shuts the socket after sending it.
    pub fn close(&self) {
        let _ = self.sender.send(WsMessage::Close(None));
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
