use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::gateway::{answer_channel, key_from_path, request_channel};
use super::runtime::{ClientOptions, SubscriberClient};
use super::session::{Action, ClientEvent, Session, SessionEvent, SessionState, Status};
use crate::broker::engine::{self, SharedBroker};
use crate::broker::{Broker, ConnectionId, Envelope, MessageType};
use crate::persistence::MemoryStore;
use crate::transport::serve;
use crate::utils::error::GatewayError;

fn open_session() -> Session {
    let mut session = Session::new();
    session.handle(SessionEvent::Start);
    session.handle(SessionEvent::TransportOpened);
    session
}

fn welcome(id: u64) -> SessionEvent {
    SessionEvent::Inbound(Envelope::welcome(ConnectionId(id)))
}

#[test]
fn test_start_arms_watchdog_and_connects() {
    let mut session = Session::new();
    assert_eq!(
        session.handle(SessionEvent::Start),
        vec![Action::StartWatchdog, Action::Connect]
    );
    assert_eq!(session.state(), SessionState::Connecting);

    // already started
    assert!(session.handle(SessionEvent::Start).is_empty());
}

#[test]
fn test_open_sends_ping_and_arms_timers() {
    let mut session = Session::new();
    session.handle(SessionEvent::Start);

    let actions = session.handle(SessionEvent::TransportOpened);
    assert_eq!(
        actions,
        vec![
            Action::Notify(ClientEvent::Status(Status::Open)),
            Action::Send(Envelope::ping()),
            Action::ArmPongDeadline,
            Action::SchedulePing,
        ]
    );
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_pong_cancels_deadline() {
    let mut session = open_session();
    let actions = session.handle(SessionEvent::Inbound(Envelope::pong()));
    assert_eq!(actions, vec![Action::CancelPongDeadline]);
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_ping_due_repeats_heartbeat() {
    let mut session = open_session();
    assert_eq!(
        session.handle(SessionEvent::PingDue),
        vec![
            Action::Send(Envelope::ping()),
            Action::ArmPongDeadline,
            Action::SchedulePing,
        ]
    );
}

#[test]
fn test_pong_deadline_forces_reconnect() {
    let mut session = open_session();
    session.handle(welcome(3));

    let actions = session.handle(SessionEvent::PongDeadline);
    assert_eq!(
        actions,
        vec![
            Action::Notify(ClientEvent::Status(Status::Warning)),
            Action::Disconnect,
            Action::Connect,
        ]
    );
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(session.connection_id(), None);
}

#[test]
fn test_subscribe_before_welcome_is_sent_after_welcome() {
    let mut session = Session::new();
    session.handle(SessionEvent::Start);
    assert!(session.handle(SessionEvent::Subscribe("b".into())).is_empty());
    session.handle(SessionEvent::TransportOpened);
    assert!(session.handle(SessionEvent::Subscribe("a".into())).is_empty());

    let actions = session.handle(welcome(7));
    assert_eq!(
        actions,
        vec![
            Action::Notify(ClientEvent::Welcome(ConnectionId(7))),
            Action::Send(Envelope::subscribe("a")),
            Action::Send(Envelope::subscribe("b")),
        ]
    );
    assert_eq!(session.connection_id(), Some(ConnectionId(7)));
}

#[test]
fn test_subscribe_after_welcome_is_sent_immediately() {
    let mut session = open_session();
    session.handle(welcome(1));

    assert_eq!(
        session.handle(SessionEvent::Subscribe("k".into())),
        vec![Action::Send(Envelope::subscribe("k"))]
    );
    assert_eq!(
        session.handle(SessionEvent::Unsubscribe("k".into())),
        vec![Action::Send(Envelope::unsubscribe("k"))]
    );
    assert!(session.keys().is_empty());
}

#[test]
fn test_unsubscribed_key_is_not_restored() {
    let mut session = open_session();
    session.handle(SessionEvent::Subscribe("gone".into()));
    session.handle(SessionEvent::Subscribe("kept".into()));
    session.handle(SessionEvent::Unsubscribe("gone".into()));

    let actions = session.handle(welcome(2));
    assert!(actions.contains(&Action::Send(Envelope::subscribe("kept"))));
    assert!(!actions.contains(&Action::Send(Envelope::subscribe("gone"))));
}

#[test]
fn test_close_waits_for_watchdog_to_redial() {
    let mut session = open_session();
    session.handle(welcome(1));

    let actions = session.handle(SessionEvent::TransportClosed);
    assert_eq!(
        actions,
        vec![
            Action::Notify(ClientEvent::Status(Status::Close)),
            Action::Disconnect,
        ]
    );
    assert_eq!(session.state(), SessionState::Reconnecting);

    // a second close for the same transport is ignored
    assert!(session.handle(SessionEvent::TransportClosed).is_empty());

    let actions = session.handle(SessionEvent::WatchdogTick);
    assert!(actions.contains(&Action::Connect));
    assert_eq!(session.state(), SessionState::Connecting);
}

#[test]
fn test_failed_dial_is_retried_by_watchdog() {
    let mut session = Session::new();
    session.handle(SessionEvent::Start);

    let actions = session.handle(SessionEvent::TransportError("refused".into()));
    assert_eq!(actions[0], Action::Notify(ClientEvent::Status(Status::Error)));
    assert_eq!(session.state(), SessionState::Reconnecting);

    assert_eq!(
        session.handle(SessionEvent::WatchdogTick),
        vec![
            Action::Notify(ClientEvent::Status(Status::Warning)),
            Action::Disconnect,
            Action::Connect,
        ]
    );
}

#[test]
fn test_watchdog_leaves_open_session_alone() {
    let mut session = open_session();
    assert!(session.handle(SessionEvent::WatchdogTick).is_empty());
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_publish_only_when_open() {
    let mut session = Session::new();
    assert!(
        session
            .handle(SessionEvent::Publish {
                key: "k".into(),
                value: json!(1),
            })
            .is_empty()
    );

    let mut session = open_session();
    let actions = session.handle(SessionEvent::Publish {
        key: "k".into(),
        value: json!({"n": 1}),
    });
    match actions.as_slice() {
        [Action::Send(envelope)] => {
            assert_eq!(envelope.kind, MessageType::Publish);
            assert_eq!(envelope.key.as_deref(), Some("k"));
            assert_eq!(envelope.value, Some(json!({"n": 1})));
            assert!(envelope.date.is_some());
        }
        other => panic!("expected one send, got {other:?}"),
    }
}

#[test]
fn test_inbound_publish_and_acks_are_notified() {
    let mut session = open_session();

    let publish = Envelope::publish("k", json!("v"));
    assert_eq!(
        session.handle(SessionEvent::Inbound(publish.clone())),
        vec![Action::Notify(ClientEvent::Publish(publish))]
    );

    let ack = Envelope::subscribe_success(ConnectionId(4), "k", None);
    match session.handle(SessionEvent::Inbound(ack)).as_slice() {
        [Action::Notify(ClientEvent::Subscribed(ack))] => {
            assert_eq!(ack.connection_id, ConnectionId(4));
            assert_eq!(ack.key, "k");
            assert_eq!(ack.cached_value, None);
        }
        other => panic!("expected a subscribed notification, got {other:?}"),
    }
}

#[test]
fn test_inbound_ignored_unless_open() {
    let mut session = Session::new();
    session.handle(SessionEvent::Start);
    assert!(session.handle(welcome(9)).is_empty());
    assert_eq!(session.connection_id(), None);
}

#[test]
fn test_stop_tears_down_once() {
    let mut session = open_session();
    assert_eq!(
        session.handle(SessionEvent::Stop),
        vec![Action::StopWatchdog, Action::Disconnect]
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.handle(SessionEvent::Stop).is_empty());
    assert!(session.handle(SessionEvent::WatchdogTick).is_empty());
    assert!(session.handle(SessionEvent::PongDeadline).is_empty());
}

#[test]
fn test_status_display() {
    assert_eq!(Status::Open.to_string(), "open");
    assert_eq!(Status::Warning.to_string(), "warning");
}

#[test]
fn test_channel_names() {
    assert_eq!(request_channel("orders"), "orders.q");
    assert_eq!(answer_channel("orders"), "orders.a");
}

#[test]
fn test_key_from_path() {
    let body = json!({
        "order": {"id": "A-17", "line": 3, "paid": true, "tags": ["x", "y"]},
        "empty": "",
        "nothing": null
    });

    assert_eq!(key_from_path(&body, "order.id").unwrap(), "A-17");
    assert_eq!(key_from_path(&body, "order.line").unwrap(), "3");
    assert_eq!(key_from_path(&body, "order.paid").unwrap(), "true");
    assert_eq!(key_from_path(&body, "order.tags.1").unwrap(), "y");

    for bad in ["order", "order.missing", "empty", "nothing", "order.tags", ""] {
        assert!(
            matches!(key_from_path(&body, bad), Err(GatewayError::InvalidKeyPath(_))),
            "path {bad:?} should be rejected"
        );
    }
}

async fn setup_server() -> (String, SharedBroker) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let broker = Broker::new(MemoryStore::new()).into_shared();

    tokio::spawn(serve(listener, broker.clone()));
    (url, broker)
}

fn options(url: &str) -> ClientOptions {
    ClientOptions {
        url: url.to_string(),
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(5),
        watchdog_interval: Duration::from_millis(200),
    }
}

async fn next_matching(
    events: &mut UnboundedReceiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("client event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

async fn next_welcome(events: &mut UnboundedReceiver<ClientEvent>) -> ConnectionId {
    match next_matching(events, |e| matches!(e, ClientEvent::Welcome(_))).await {
        ClientEvent::Welcome(id) => id,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_client_subscribes_and_receives_publish() {
    let (url, _broker) = setup_server().await;
    let (handle, mut events) = SubscriberClient::start(options(&url));

    handle.subscribe("prices");
    next_welcome(&mut events).await;
    next_matching(&mut events, |e| matches!(e, ClientEvent::Subscribed(ack) if ack.key == "prices")).await;
    assert_eq!(handle.state(), SessionState::Open);

    handle.publish("prices", json!({"eur": 1.08}));
    let delivered = next_matching(&mut events, |e| matches!(e, ClientEvent::Publish(_))).await;
    match delivered {
        ClientEvent::Publish(envelope) => {
            assert_eq!(envelope.key.as_deref(), Some("prices"));
            assert_eq!(envelope.value, Some(json!({"eur": 1.08})));
        }
        _ => unreachable!(),
    }

    handle.stop();
}

#[tokio::test]
async fn test_client_reconnects_and_resubscribes_after_server_error() {
    let (url, broker) = setup_server().await;
    let (handle, mut events) = SubscriberClient::start(options(&url));

    handle.subscribe("k");
    let first = next_welcome(&mut events).await;
    next_matching(&mut events, |e| matches!(e, ClientEvent::Subscribed(_))).await;

    engine::lock(&broker).on_error(first, &"injected failure");

    let second = next_welcome(&mut events).await;
    assert_ne!(first, second);
    let resubscribed = next_matching(&mut events, |e| matches!(e, ClientEvent::Subscribed(_))).await;
    match resubscribed {
        ClientEvent::Subscribed(ack) => {
            assert_eq!(ack.connection_id, second);
            assert_eq!(ack.key, "k");
        }
        _ => unreachable!(),
    }

    {
        let guard = engine::lock(&broker);
        assert!(guard.registry().is_subscribed(second, "k"));
        assert!(!guard.registry().is_subscribed(first, "k"));
    }

    handle.stop();
}

#[tokio::test]
async fn test_stop_ends_client_task() {
    let (url, broker) = setup_server().await;
    let (handle, mut events) = SubscriberClient::start(options(&url));
    next_welcome(&mut events).await;

    handle.stop();

    // the task drops its event sender on the way out
    timeout(Duration::from_secs(5), async {
        while events.recv().await.is_some() {}
    })
    .await
    .expect("client task did not stop");
    assert_eq!(handle.state(), SessionState::Disconnected);

    for _ in 0..100 {
        if engine::lock(&broker).connection_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broker still holds the connection");
}

/// A server that greets every connection with a fresh id and never answers
/// pings.
async fn silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let next_id = Arc::new(AtomicU64::new(1));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                let welcome = Envelope::welcome(ConnectionId(id)).to_text().unwrap();
                if ws.send(WsMessage::Text(welcome.into())).await.is_err() {
                    return;
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    url
}

#[tokio::test]
async fn test_missing_pong_restarts_connection() {
    let url = silent_server().await;
    let (handle, mut events) = SubscriberClient::start(ClientOptions {
        pong_timeout: Duration::from_millis(200),
        watchdog_interval: Duration::from_secs(60),
        ..options(&url)
    });

    let first = next_welcome(&mut events).await;
    next_matching(&mut events, |e| *e == ClientEvent::Status(Status::Warning)).await;
    let second = next_welcome(&mut events).await;

    assert_ne!(first, second);
    handle.stop();
}
