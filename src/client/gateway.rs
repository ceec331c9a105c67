//! Request/response over pub/sub.
//!
//! A call on channel `C` subscribes to `C.a`, publishes the request to
//! `C.q` once the subscription is acknowledged, and takes the first publish
//! that comes back as the answer. Whoever serves `C` subscribes to `C.q` and
//! publishes its reply on `C.a`. One deadline covers the whole exchange,
//! connect included.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Envelope, MessageType};
use crate::config::GatewaySettings;
use crate::utils::error::{GatewayError, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed for the unsubscribe and close after a call.
const FAREWELL_GRACE: Duration = Duration::from_secs(1);

pub fn request_channel(channel: &str) -> String {
    format!("{channel}.q")
}

pub fn answer_channel(channel: &str) -> String {
    format!("{channel}.a")
}

#[derive(Debug, Clone)]
pub struct Gateway {
    url: String,
    timeout: Duration,
}

impl Gateway {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn from_settings(url: impl Into<String>, settings: &GatewaySettings) -> Self {
        Self::new(url, settings.response_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish `payload` on `channel.q` and wait for the first publish on
    /// `channel.a`. Returns that envelope's `value` (`Null` if it had none).
    pub async fn request(&self, channel: &str, payload: Value) -> Result<Value, GatewayError> {
        let deadline = Instant::now() + self.timeout;
        let answer_key = answer_channel(channel);

        let mut ws = self.connect(deadline).await?;

        let result = match timeout_at(deadline, exchange(&mut ws, channel, &answer_key, payload)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("no answer on [{answer_key}] within {:?}", self.timeout);
                Err(GatewayError::Timeout(self.timeout))
            }
        };

        if !matches!(result, Err(GatewayError::ConnectionClosed)) {
            farewell(&mut ws, &answer_key).await;
        }

        result
    }

    /// Connect, publish one envelope to `key` and close. Returns what was
    /// sent.
    pub async fn publish(&self, key: &str, value: Value) -> Result<Envelope, GatewayError> {
        let deadline = Instant::now() + self.timeout;
        let mut ws = self.connect(deadline).await?;

        let envelope = Envelope::publish(key, value);
        send(&mut ws, &envelope).await?;
        info!("published on [{key}]");

        if let Err(e) = ws.close(None).await {
            debug!("close after publish failed: {e}");
        }
        Ok(envelope)
    }

    async fn connect(&self, deadline: Instant) -> Result<WsStream, GatewayError> {
        match timeout_at(deadline, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(GatewayError::Connect(e)),
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }
}

async fn exchange(
    ws: &mut WsStream,
    channel: &str,
    answer_key: &str,
    payload: Value,
) -> Result<Value, GatewayError> {
    let mut request = Some(payload);

    while let Some(frame) = ws.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => return Err(GatewayError::ConnectionClosed),
            Ok(_) => continue,
            Err(e) => {
                warn!("gateway connection failed: {e}");
                return Err(GatewayError::ConnectionClosed);
            }
        };

        let envelope = match Envelope::parse(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ignoring frame: {e}");
                continue;
            }
        };

        match envelope.kind {
            MessageType::Welcome => {
                send(ws, &Envelope::subscribe(answer_key)).await?;
            }
            MessageType::SubscribeSuccess => {
                let acked = envelope
                    .subscribe_ack()
                    .is_some_and(|ack| ack.key == answer_key);
                if acked {
                    if let Some(value) = request.take() {
                        send(ws, &Envelope::publish(request_channel(channel), value)).await?;
                        debug!("request sent on [{}]", request_channel(channel));
                    }
                }
            }
            MessageType::Publish => {
                info!("answer received on [{answer_key}]");
                return Ok(envelope.value.unwrap_or(Value::Null));
            }
            _ => {}
        }
    }

    Err(GatewayError::ConnectionClosed)
}

async fn send(ws: &mut WsStream, envelope: &Envelope) -> Result<(), GatewayError> {
    let msg = envelope
        .to_ws_message()
        .map_err(|e| GatewayError::Protocol(ProtocolError::from(e)))?;
    ws.send(msg).await.map_err(GatewayError::Send)
}

async fn farewell(ws: &mut WsStream, answer_key: &str) {
    if timeout(FAREWELL_GRACE, send(ws, &Envelope::unsubscribe(answer_key)))
        .await
        .is_err()
    {
        debug!("unsubscribe from [{answer_key}] timed out");
    }
    let _ = timeout(FAREWELL_GRACE, ws.close(None)).await;
}

/// Read a subscription key out of a JSON body by dotted path, e.g.
/// `"order.id"`. Array elements can be addressed by index.
pub fn key_from_path(body: &Value, path: &str) -> Result<String, GatewayError> {
    let invalid = || GatewayError::InvalidKeyPath(path.to_string());

    let leaf = path
        .split('.')
        .try_fold(body, |node, segment| match node {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => node.get(segment),
        })
        .ok_or_else(invalid)?;

    match leaf {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(invalid()),
    }
}
