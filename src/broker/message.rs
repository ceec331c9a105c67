//! Wire envelope shared by the broker and every client.
//!
//! One JSON object per WebSocket text frame. `type` selects the operation;
//! `key`, `value` and `date` are present depending on the type. The broker
//! never looks inside `value` for a publish: the envelope, including any
//! extra top-level fields, is stored and forwarded as received.
//!
//! Acknowledgements from the server nest their fields under `value`:
//!
//! ```json
//! {"type":"subscribeSuccess","value":{"connectionId":7,"key":"k","cachedValue":null}}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::ConnectionId;
use crate::utils::error::ProtocolError;

/// Format used for the advisory `date` field.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Welcome,
    Ping,
    Pong,
    Subscribe,
    SubscribeSuccess,
    Unsubscribe,
    UnsubscribeSuccess,
    Publish,
    /// Any `type` string this relay does not understand.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Welcome => "welcome",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Subscribe => "subscribe",
            MessageType::SubscribeSuccess => "subscribeSuccess",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::UnsubscribeSuccess => "unsubscribeSuccess",
            MessageType::Publish => "publish",
            MessageType::Unknown => "unknown",
        }
    }
}

/// `value` and `date` distinguish "absent" (`None`) from an explicit JSON
/// `null` (`Some(Value::Null)`). Top-level fields this relay does not know
/// about are kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    /// Publisher-set timestamp. Carried through untouched, never used for
    /// ordering.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub date: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Only called when the field is in the object, so `null` becomes
/// `Some(Value::Null)`; a missing field falls back to `default`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Body of a `welcome` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: ConnectionId,
}

/// Body of a `subscribeSuccess` envelope. `cached_value` is the last
/// envelope published to `key`, serialized as `null` when there is none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub connection_id: ConnectionId,
    pub key: String,
    #[serde(default)]
    pub cached_value: Option<Envelope>,
}

/// Body of an `unsubscribeSuccess` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeAck {
    pub connection_id: ConnectionId,
    pub key: String,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            key: None,
            value: None,
            date: None,
            extra: Map::new(),
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    pub fn subscribe(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(MessageType::Subscribe)
        }
    }

    pub fn unsubscribe(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(MessageType::Unsubscribe)
        }
    }

    /// A publish envelope dated with the local wall clock.
    pub fn publish(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value),
            date: Some(Value::String(now_date())),
            ..Self::new(MessageType::Publish)
        }
    }

    pub fn welcome(connection_id: ConnectionId) -> Self {
        Self::with_body(MessageType::Welcome, &Welcome { connection_id })
    }

    pub fn subscribe_success(
        connection_id: ConnectionId,
        key: &str,
        cached_value: Option<Envelope>,
    ) -> Self {
        Self::with_body(
            MessageType::SubscribeSuccess,
            &SubscribeAck {
                connection_id,
                key: key.to_string(),
                cached_value,
            },
        )
    }

    pub fn unsubscribe_success(connection_id: ConnectionId, key: &str) -> Self {
        Self::with_body(
            MessageType::UnsubscribeSuccess,
            &UnsubscribeAck {
                connection_id,
                key: key.to_string(),
            },
        )
    }

    fn with_body<T: Serialize>(kind: MessageType, body: &T) -> Self {
        // The ack bodies are plain structs of strings and integers; turning
        // them into a `Value` cannot fail.
        let value = serde_json::to_value(body).unwrap_or(Value::Null);
        Self {
            value: Some(value),
            ..Self::new(kind)
        }
    }

    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_ws_message(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::text(self.to_text()?))
    }

    pub fn require_key(&self) -> Result<&str, ProtocolError> {
        self.key.as_deref().ok_or(ProtocolError::MissingField {
            kind: self.kind.as_str(),
            field: "key",
        })
    }

    pub fn require_value(&self) -> Result<&Value, ProtocolError> {
        self.value.as_ref().ok_or(ProtocolError::MissingField {
            kind: self.kind.as_str(),
            field: "value",
        })
    }

    pub fn welcome_body(&self) -> Option<Welcome> {
        self.body(MessageType::Welcome)
    }

    pub fn subscribe_ack(&self) -> Option<SubscribeAck> {
        self.body(MessageType::SubscribeSuccess)
    }

    pub fn unsubscribe_ack(&self) -> Option<UnsubscribeAck> {
        self.body(MessageType::UnsubscribeSuccess)
    }

    fn body<T: serde::de::DeserializeOwned>(&self, expected: MessageType) -> Option<T> {
        if self.kind != expected {
            return None;
        }
        self.value
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

pub fn now_date() -> String {
    chrono::Local::now().format(DATE_FORMAT).to_string()
}
