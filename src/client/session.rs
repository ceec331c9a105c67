//! Client session state machine
//!
//! `Session` owns no sockets and no timers. It consumes `SessionEvent`s
//! (transport callbacks, timer expiries, caller commands) and returns the
//! `Action`s the driver must perform. All heartbeat, watchdog and
//! reconnect policy lives here; `runtime` only executes it.
//!
//! ```text
//! Disconnected --Start--> Connecting --TransportOpened--> Open
//!      ^                    ^   ^                          |
//!      |                    |   +------PongDeadline--------+
//!     Stop                  |                              | close / error
//!                     WatchdogTick                         v
//!                           +---------------------- Reconnecting
//! ```
//!
//! On close or error the session does not redial on its own. It waits for
//! the next watchdog tick, which bounds reconnect attempts to one per
//! watchdog interval.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::connection::ConnectionId;
use crate::broker::message::{Envelope, MessageType, SubscribeAck, UnsubscribeAck};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    /// The transport dropped; the watchdog will redial.
    Reconnecting,
}

/// Coarse connection status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Error,
    Close,
    /// The session is about to tear the transport down and redial.
    Warning,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Open => "open",
            Status::Error => "error",
            Status::Close => "close",
            Status::Warning => "warning",
        };
        f.write_str(s)
    }
}

/// What the caller of a subscriber client gets to see.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Status(Status),
    Welcome(ConnectionId),
    Publish(Envelope),
    Subscribed(SubscribeAck),
    Unsubscribed(UnsubscribeAck),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start,
    Stop,
    TransportOpened,
    TransportError(String),
    TransportClosed,
    Inbound(Envelope),
    PingDue,
    PongDeadline,
    WatchdogTick,
    Subscribe(String),
    Unsubscribe(String),
    Publish { key: String, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Dial the broker.
    Connect,
    /// Drop the transport (or pending dial) and cancel the heartbeat timers.
    /// Idempotent.
    Disconnect,
    Send(Envelope),
    ArmPongDeadline,
    CancelPongDeadline,
    SchedulePing,
    StartWatchdog,
    StopWatchdog,
    Notify(ClientEvent),
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    connection_id: Option<ConnectionId>,
    keys: BTreeSet<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            connection_id: None,
            keys: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id from the most recent `welcome` on the current transport.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Keys the caller wants; re-subscribed after every `welcome`.
    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    fn welcomed(&self) -> bool {
        self.state == SessionState::Open && self.connection_id.is_some()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        use SessionState::*;

        match event {
            SessionEvent::Start => match self.state {
                Disconnected => {
                    self.state = Connecting;
                    vec![Action::StartWatchdog, Action::Connect]
                }
                _ => Vec::new(),
            },

            SessionEvent::Stop => {
                if self.state == Disconnected {
                    return Vec::new();
                }
                self.state = Disconnected;
                self.connection_id = None;
                vec![Action::StopWatchdog, Action::Disconnect]
            }

            SessionEvent::TransportOpened => match self.state {
                Connecting => {
                    info!("WebSocket open");
                    self.state = Open;
                    let mut actions = vec![Action::Notify(ClientEvent::Status(Status::Open))];
                    actions.extend(self.heartbeat());
                    actions
                }
                _ => Vec::new(),
            },

            SessionEvent::TransportError(reason) => match self.state {
                Connecting | Open => {
                    warn!("WebSocket error: {reason}");
                    self.lose_transport(Status::Error)
                }
                _ => Vec::new(),
            },

            SessionEvent::TransportClosed => match self.state {
                Connecting | Open => {
                    warn!("WebSocket closed");
                    self.lose_transport(Status::Close)
                }
                _ => Vec::new(),
            },

            SessionEvent::Inbound(envelope) => {
                if self.state != Open {
                    debug!("dropping {} received while {:?}", envelope.kind.as_str(), self.state);
                    return Vec::new();
                }
                self.on_inbound(envelope)
            }

            SessionEvent::PingDue => match self.state {
                Open => self.heartbeat(),
                _ => Vec::new(),
            },

            SessionEvent::PongDeadline => match self.state {
                Open => {
                    warn!("no pong from server in time, restarting WebSocket");
                    self.redial()
                }
                _ => Vec::new(),
            },

            SessionEvent::WatchdogTick => match self.state {
                Open => {
                    debug!("watchdog: WebSocket is open");
                    Vec::new()
                }
                Connecting | Reconnecting => {
                    warn!("watchdog: WebSocket is not open, restarting it");
                    self.redial()
                }
                Disconnected => Vec::new(),
            },

            SessionEvent::Subscribe(key) => {
                info!("subscribe for key [{key}]");
                let send = self.welcomed();
                self.keys.insert(key.clone());
                if send {
                    vec![Action::Send(Envelope::subscribe(key))]
                } else {
                    Vec::new()
                }
            }

            SessionEvent::Unsubscribe(key) => {
                info!("unsubscribe for key [{key}]");
                self.keys.remove(&key);
                if self.welcomed() {
                    vec![Action::Send(Envelope::unsubscribe(key))]
                } else {
                    Vec::new()
                }
            }

            SessionEvent::Publish { key, value } => {
                if self.state == Open {
                    info!("publish for key [{key}]");
                    vec![Action::Send(Envelope::publish(key, value))]
                } else {
                    warn!("publish for key [{key}] dropped, WebSocket is not open");
                    Vec::new()
                }
            }
        }
    }

    fn on_inbound(&mut self, envelope: Envelope) -> Vec<Action> {
        match envelope.kind {
            MessageType::Pong => {
                debug!("pong");
                vec![Action::CancelPongDeadline]
            }
            MessageType::Welcome => {
                let Some(welcome) = envelope.welcome_body() else {
                    warn!("welcome without a connectionId");
                    return Vec::new();
                };
                info!("welcome: connectionId = [{}]", welcome.connection_id);
                self.connection_id = Some(welcome.connection_id);

                let mut actions = vec![Action::Notify(ClientEvent::Welcome(welcome.connection_id))];
                actions.extend(
                    self.keys
                        .iter()
                        .map(|key| Action::Send(Envelope::subscribe(key.clone()))),
                );
                actions
            }
            MessageType::Publish => {
                debug!("publish: key = [{}]", envelope.key.as_deref().unwrap_or_default());
                vec![Action::Notify(ClientEvent::Publish(envelope))]
            }
            MessageType::SubscribeSuccess => match envelope.subscribe_ack() {
                Some(ack) => {
                    info!(
                        "subscribeSuccess: connectionId = [{}], key = [{}]",
                        ack.connection_id, ack.key
                    );
                    vec![Action::Notify(ClientEvent::Subscribed(ack))]
                }
                None => Vec::new(),
            },
            MessageType::UnsubscribeSuccess => match envelope.unsubscribe_ack() {
                Some(ack) => {
                    info!(
                        "unsubscribeSuccess: connectionId = [{}], key = [{}]",
                        ack.connection_id, ack.key
                    );
                    vec![Action::Notify(ClientEvent::Unsubscribed(ack))]
                }
                None => Vec::new(),
            },
            other => {
                debug!("unknown message: {}", other.as_str());
                Vec::new()
            }
        }
    }

    fn heartbeat(&self) -> Vec<Action> {
        vec![
            Action::Send(Envelope::ping()),
            Action::ArmPongDeadline,
            Action::SchedulePing,
        ]
    }

    fn lose_transport(&mut self, status: Status) -> Vec<Action> {
        self.state = SessionState::Reconnecting;
        self.connection_id = None;
        vec![Action::Notify(ClientEvent::Status(status)), Action::Disconnect]
    }

    fn redial(&mut self) -> Vec<Action> {
        self.state = SessionState::Connecting;
        self.connection_id = None;
        vec![
            Action::Notify(ClientEvent::Status(Status::Warning)),
            Action::Disconnect,
            Action::Connect,
        ]
    }
}
