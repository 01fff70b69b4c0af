//! WebSocket view of the retained bus.
//!
//! Every connecting client first receives the retained snapshot, one JSON
//! object per topic, then a live stream of every publication:
//!
//! ```json
//! {"topic":"/devices/tlv493d/controls/field","payload":"12.34","retained":true,"timestamp":"..."}
//! ```
//!
//! The bridge is read-only; inbound text frames are ignored.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use magbridge_types::{BridgeError, Publication};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::RetainedBus;

/// Bind `addr` and spawn the accept loop.  The returned task serves
/// clients until aborted.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] if the TCP listener cannot be bound;
/// nothing is spawned in that case.
pub async fn serve(bus: RetainedBus, addr: SocketAddr) -> Result<JoinHandle<()>, BridgeError> {
    let listener = bind(addr).await?;
    Ok(tokio::spawn(serve_listener(bus, listener)))
}

/// Bind the listening socket without accepting yet.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, BridgeError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::Transport(format!("ws bind error on {addr}: {e}")))?;
    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "ws bridge listening");
    }
    Ok(listener)
}

/// Accept loop over an already bound listener.
pub async fn serve_listener(bus: RetainedBus, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(bus, stream, peer).await {
                        error!(peer = %peer, error = %e, "ws client error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "ws accept error");
            }
        }
    }
}

fn encode(publication: &Publication) -> Result<Message, BridgeError> {
    serde_json::to_string(publication)
        .map(|json| Message::Text(json.into()))
        .map_err(|e| BridgeError::Transport(e.to_string()))
}

async fn handle_client(
    bus: RetainedBus,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), BridgeError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BridgeError::Transport(format!("ws handshake from {peer}: {e}")))?;
    debug!(peer = %peer, "ws client connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    // Subscribe before taking the snapshot so nothing published in between
    // is missed.
    let mut rx = bus.subscribe();

    for publication in bus.retained_snapshot() {
        if ws_tx.send(encode(&publication)?).await.is_err() {
            return Ok(());
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(publication) => {
                        if ws_tx.send(encode(&publication)?).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(peer = %peer, lagged_by = n, "ws client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!(peer = %peer, "ws client disconnected");
    Ok(())
}
