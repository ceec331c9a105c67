use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::serve;
use crate::broker::engine::{self, SharedBroker};
use crate::broker::{Broker, Envelope, MessageType};
use crate::persistence::MemoryStore;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn setup_server() -> (String, SharedBroker) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let broker = Broker::new(MemoryStore::new()).into_shared();

    tokio::spawn(serve(listener, broker.clone()));
    (url, broker)
}

async fn connect(url: &str) -> (Ws, u64) {
    let (mut ws, _) = connect_async(url).await.expect("WebSocket handshake failed");
    let welcome = recv(&mut ws).await;
    let id = welcome.welcome_body().expect("first frame is welcome").connection_id;
    (ws, id.0)
}

async fn recv(ws: &mut Ws) -> Envelope {
    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("read error");
    match frame {
        WsMessage::Text(text) => Envelope::parse(text.as_str()).unwrap(),
        other => panic!("Expected a text frame, got {other:?}"),
    }
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(WsMessage::Text(msg.to_string().into()))
        .await
        .expect("send failed");
}

async fn wait_until(broker: &SharedBroker, check: impl Fn(&Broker) -> bool) {
    for _ in 0..100 {
        {
            let guard = engine::lock(broker);
            if check(&*guard) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_welcome_carries_distinct_ids() {
    let (url, _broker) = setup_server().await;
    let (_a, id_a) = connect(&url).await;
    let (_b, id_b) = connect(&url).await;
    assert_ne!(id_a, id_b);
}

#[tokio::test]
async fn test_ping_pong_over_socket() {
    let (url, _broker) = setup_server().await;
    let (mut ws, _) = connect(&url).await;

    send(&mut ws, json!({"type": "ping"})).await;

    assert_eq!(recv(&mut ws).await.kind, MessageType::Pong);
}

#[tokio::test]
async fn test_subscribe_and_publish_between_two_clients() {
    let (url, _broker) = setup_server().await;
    let (mut subscriber, sub_id) = connect(&url).await;
    let (mut publisher, _) = connect(&url).await;

    send(&mut subscriber, json!({"type": "subscribe", "key": "chat"})).await;
    let ack = recv(&mut subscriber).await.subscribe_ack().unwrap();
    assert_eq!(ack.connection_id.0, sub_id);
    assert_eq!(ack.key, "chat");

    send(
        &mut publisher,
        json!({"type": "publish", "key": "chat", "value": {"text": "hi"}, "date": "2024-05-01 10:00:00"}),
    )
    .await;

    let delivered = recv(&mut subscriber).await;
    assert_eq!(delivered.kind, MessageType::Publish);
    assert_eq!(delivered.key.as_deref(), Some("chat"));
    assert_eq!(delivered.value, Some(json!({"text": "hi"})));
    assert_eq!(delivered.date, Some(json!("2024-05-01 10:00:00")));
}

#[tokio::test]
async fn test_invalid_frames_keep_connection_open() {
    let (url, _broker) = setup_server().await;
    let (mut ws, _) = connect(&url).await;

    ws.send(WsMessage::Text("{{{".into())).await.unwrap();
    ws.send(WsMessage::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    send(&mut ws, json!({"type": "whatever"})).await;
    send(&mut ws, json!({"type": "ping"})).await;

    assert_eq!(recv(&mut ws).await.kind, MessageType::Pong);
}

#[tokio::test]
async fn test_client_close_cleans_up_broker_state() {
    let (url, broker) = setup_server().await;
    let (mut ws, _) = connect(&url).await;

    send(&mut ws, json!({"type": "subscribe", "key": "k"})).await;
    recv(&mut ws).await;
    wait_until(&broker, |b| b.registry().subscription_count() == 1).await;

    ws.close(None).await.unwrap();

    wait_until(&broker, |b| b.connection_count() == 0 && b.registry().is_empty()).await;
}
