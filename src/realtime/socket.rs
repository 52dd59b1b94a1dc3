//! WebSocket endpoint plumbing for scope subscriptions.
//!
//! Clients connect to `GET /ws/{scope}` and receive every frame broadcast
//! to that scope for as long as the socket stays open. The server drives a
//! protocol-level ping on the heartbeat interval so dead peers are noticed
//! without application traffic.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use super::{ConnectionHandle, ConnectionRegistry};

/// Frames buffered per connection before the client counts as slow.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct RealtimeState {
    pub registry: Arc<ConnectionRegistry>,
    pub heartbeat: Duration,
    pub outbound_capacity: usize,
}

impl RealtimeState {
    pub fn new(registry: Arc<ConnectionRegistry>, heartbeat: Duration) -> Self {
        Self {
            registry,
            heartbeat,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Handler for `GET /ws/{scope}`: upgrade, then serve until either side
/// closes. The scope is opaque here; callers of
/// [`ConnectionRegistry::broadcast`](super::ConnectionRegistry::broadcast)
/// give it meaning.
pub async fn scope_events_handler(
    State(state): State<RealtimeState>,
    Path(scope): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        serve_connection(
            socket,
            scope,
            state.registry,
            state.heartbeat,
            state.outbound_capacity,
        )
        .await;
    })
}

/// Drive one upgraded WebSocket until either side closes.
///
/// Registers the connection under `scope`, pumps broadcast frames out as
/// text, answers client pings, and sends a ping each heartbeat interval.
/// The registry entry is removed on the way out.
pub async fn serve_connection(
    socket: WebSocket,
    scope: String,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Duration,
    outbound_capacity: usize,
) {
    let (tx, mut rx) = mpsc::channel::<String>(outbound_capacity);
    let handle = ConnectionHandle::new(tx);
    let connection_id = handle.id();
    registry.register(&scope, handle);

    info!(scope = %scope, connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat_interval = interval(heartbeat);

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(scope = %scope, connection = %connection_id, "Client closed WebSocket");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    // Inbound text/binary/pong carry nothing for us
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(scope = %scope, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    registry.unregister(&scope, connection_id);
    info!(scope = %scope, connection = %connection_id, "WebSocket disconnected");
}
