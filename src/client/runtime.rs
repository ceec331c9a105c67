//! Subscriber client runtime
//!
//! Runs one `Session` on a tokio task. The task multiplexes the socket, the
//! pong deadline, the next-ping timer, the watchdog interval and caller
//! commands with `select!`, turns whatever fired into a `SessionEvent`, and
//! carries out the returned `Action`s. Timers are `Option`s: cancelling is
//! setting `None`, which is safe however many times it happens.
//!
//! Callers hold a `ClientHandle` for commands and read `ClientEvent`s from
//! the channel returned by `SubscriberClient::start`. Command failures are
//! logged, never returned: a broken transport is the heartbeat's and the
//! watchdog's problem.

use std::future::{Future, pending};
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::Envelope;
use crate::client::session::{Action, ClientEvent, Session, SessionEvent, SessionState};
use crate::config::ClientSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;

/// Upper bound for closing a transport we are abandoning.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub watchdog_interval: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from(&ClientSettings {
            url: url.into(),
            ..crate::config::Settings::default().client
        })
    }
}

impl From<&ClientSettings> for ClientOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            url: settings.url.clone(),
            ping_interval: settings.ping_interval(),
            pong_timeout: settings.pong_timeout(),
            watchdog_interval: settings.watchdog_interval(),
        }
    }
}

/// Command side of a running client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<SessionState>,
}

impl ClientHandle {
    pub fn subscribe(&self, key: impl Into<String>) {
        self.command(SessionEvent::Subscribe(key.into()));
    }

    pub fn unsubscribe(&self, key: impl Into<String>) {
        self.command(SessionEvent::Unsubscribe(key.into()));
    }

    pub fn publish(&self, key: impl Into<String>, value: Value) {
        self.command(SessionEvent::Publish {
            key: key.into(),
            value,
        });
    }

    /// Close the transport and end the client task.
    pub fn stop(&self) {
        self.command(SessionEvent::Stop);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn command(&self, event: SessionEvent) {
        if let Err(e) = self.commands.send(event) {
            warn!("client task is gone, command dropped: {:?}", e.0);
        }
    }
}

pub struct SubscriberClient {
    options: ClientOptions,
    session: Session,
    commands: mpsc::UnboundedReceiver<SessionEvent>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<SessionState>,
    connecting: Option<ConnectFuture>,
    sink: Option<SplitSink<WsStream, WsMessage>>,
    stream: Option<SplitStream<WsStream>>,
    pong_deadline: Option<Pin<Box<Sleep>>>,
    next_ping: Option<Pin<Box<Sleep>>>,
    watchdog: Option<Interval>,
}

/// Whatever woke the select loop.
enum Wake {
    Command(Option<SessionEvent>),
    Watchdog,
    PongDeadline,
    PingDue,
    Connected(Result<WsStream, tungstenite::Error>),
    Frame(Option<Result<WsMessage, tungstenite::Error>>),
}

impl SubscriberClient {
    /// Spawn the client task and start connecting.
    pub fn start(options: ClientOptions) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let client = Self {
            options,
            session: Session::new(),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            connecting: None,
            sink: None,
            stream: None,
            pong_deadline: None,
            next_ping: None,
            watchdog: None,
        };
        tokio::spawn(client.run());

        (
            ClientHandle {
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    async fn run(mut self) {
        self.dispatch(SessionEvent::Start).await;

        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                _ = tick(&mut self.watchdog) => Wake::Watchdog,
                _ = fire(&mut self.pong_deadline) => Wake::PongDeadline,
                _ = fire(&mut self.next_ping) => Wake::PingDue,
                res = finish_connect(&mut self.connecting) => Wake::Connected(res),
                frame = next_frame(&mut self.stream) => Wake::Frame(frame),
            };

            let event = match wake {
                Wake::Command(Some(event)) => event,
                // every handle dropped
                Wake::Command(None) => SessionEvent::Stop,
                Wake::Watchdog => SessionEvent::WatchdogTick,
                Wake::PongDeadline => {
                    self.pong_deadline = None;
                    SessionEvent::PongDeadline
                }
                Wake::PingDue => {
                    self.next_ping = None;
                    SessionEvent::PingDue
                }
                Wake::Connected(res) => {
                    self.connecting = None;
                    match res {
                        Ok(ws) => {
                            let (sink, stream) = ws.split();
                            self.sink = Some(sink);
                            self.stream = Some(stream);
                            SessionEvent::TransportOpened
                        }
                        Err(e) => SessionEvent::TransportError(e.to_string()),
                    }
                }
                Wake::Frame(frame) => match frame_event(frame) {
                    Some(event) => event,
                    None => continue,
                },
            };

            let stopping = event == SessionEvent::Stop;
            self.dispatch(event).await;
            if stopping {
                break;
            }
        }

        info!("client stopped");
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        for action in self.session.handle(event) {
            self.apply(action).await;
        }
        self.state.send_replace(self.session.state());
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::Connect => {
                info!("connecting to {}", self.options.url);
                let url = self.options.url.clone();
                self.connecting = Some(Box::pin(async move {
                    connect_async(url).await.map(|(ws, _)| ws)
                }));
            }
            Action::Disconnect => {
                self.connecting = None;
                self.pong_deadline = None;
                self.next_ping = None;
                self.stream = None;
                if let Some(mut sink) = self.sink.take() {
                    let _ = timeout(CLOSE_GRACE, sink.close()).await;
                }
            }
            Action::Send(envelope) => self.send(&envelope).await,
            Action::ArmPongDeadline => {
                self.pong_deadline = Some(Box::pin(sleep(self.options.pong_timeout)));
            }
            Action::CancelPongDeadline => self.pong_deadline = None,
            Action::SchedulePing => {
                self.next_ping = Some(Box::pin(sleep(self.options.ping_interval)));
            }
            Action::StartWatchdog => {
                // interval_at rejects a zero period
                let period = self.options.watchdog_interval.max(Duration::from_millis(1));
                let mut watchdog = interval_at(Instant::now() + period, period);
                watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.watchdog = Some(watchdog);
            }
            Action::StopWatchdog => self.watchdog = None,
            Action::Notify(event) => {
                if self.events.send(event).is_err() {
                    debug!("no one is listening for client events");
                }
            }
        }
    }

    async fn send(&mut self, envelope: &Envelope) {
        let Some(sink) = self.sink.as_mut() else {
            warn!("{} not sent, no open WebSocket", envelope.kind.as_str());
            return;
        };
        let msg = match envelope.to_ws_message() {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to serialize {}: {e}", envelope.kind.as_str());
                return;
            }
        };
        // A wedged socket must not stall the loop; the pong deadline will
        // notice it.
        match timeout(self.options.pong_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to send {}: {e}", envelope.kind.as_str()),
            Err(_) => warn!("sending {} timed out", envelope.kind.as_str()),
        }
    }
}

fn frame_event(frame: Option<Result<WsMessage, tungstenite::Error>>) -> Option<SessionEvent> {
    match frame {
        None | Some(Ok(WsMessage::Close(_))) => Some(SessionEvent::TransportClosed),
        Some(Err(e)) => Some(SessionEvent::TransportError(e.to_string())),
        Some(Ok(WsMessage::Text(text))) => match Envelope::parse(text.as_str()) {
            Ok(envelope) => Some(SessionEvent::Inbound(envelope)),
            Err(e) => {
                warn!("ignoring frame from server: {e}");
                None
            }
        },
        Some(Ok(_)) => None,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn finish_connect(connecting: &mut Option<ConnectFuture>) -> Result<WsStream, tungstenite::Error> {
    match connecting {
        Some(fut) => fut.as_mut().await,
        None => pending().await,
    }
}

async fn next_frame(
    stream: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<WsMessage, tungstenite::Error>> {
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}
