//! WebSocket transport
//!
//! Accepts TCP connections, upgrades them to WebSocket and turns each
//! transport event into one broker call:
//! - handshake complete -> `on_open` (the broker greets with `welcome`)
//! - text frame -> `on_message`
//! - read error -> `on_error`
//! - close frame or EOF -> `on_close`
//!
//! Every connection gets an unbounded channel. The broker pushes into it
//! while holding its lock; a per-connection writer task drains it into the
//! socket, so the lock is never held across network I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::engine::{self, SharedBroker};
use crate::utils::error::ServerError;

/// Bind `addr` and serve until the task is dropped.
pub async fn start_websocket_server(addr: &str, broker: SharedBroker) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    match listener.local_addr() {
        Ok(local) => info!("WebSocket server listening on ws://{local}"),
        Err(_) => info!("WebSocket server listening on ws://{addr}"),
    }

    serve(listener, broker).await;
    Ok(())
}

/// Accept loop over an already bound listener. Accept failures (for example
/// running out of file descriptors) are logged and the loop keeps going.
pub async fn serve(listener: TcpListener, broker: SharedBroker) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                spawn(handle_connection(stream, peer, broker.clone()));
            }
            Err(e) => warn!("failed to accept connection: {e}"),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: SharedBroker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("({peer}) WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let id = engine::lock(&broker).on_open(tx);
    debug!("({id}) accepted from {peer}");

    let cleanup_called = Arc::new(AtomicBool::new(false));

    let do_cleanup = {
        let broker = broker.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                engine::lock(&broker).on_close(id);
            }
        }
    };

    {
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("({id}) failed to send message: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }

            let _ = ws_sender.close().await;
            do_cleanup();
            debug!("({id}) send loop closed");
        });
    }

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                engine::lock(&broker).on_message(id, text.as_str());
            }
            Ok(WsMessage::Binary(data)) => {
                warn!("({id}) ignoring {} byte binary frame", data.len());
            }
            Ok(WsMessage::Close(_)) => break,
            // tungstenite answers pings itself
            Ok(_) => {}
            Err(e) => {
                if !cleanup_called.swap(true, Ordering::SeqCst) {
                    engine::lock(&broker).on_error(id, &e);
                }
                break;
            }
        }
    }

    do_cleanup();
}
