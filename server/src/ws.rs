//! WebSocket transport.
//!
//! Flow per connection:
//! 1. Authenticate the upgrade request (cookie or bearer), degrading to anonymous
//! 2. Register with the gateway, spawn the writer task that owns the sink
//! 3. Read loop: route text frames, record pongs
//! 4. On close, read error, or writer exit (eviction, dead socket): unregister

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::Outbound;
use crate::state::AppState;

/// Axum handler for GET /ws, upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, headers, state))
}

async fn handle_socket(socket: WebSocket, headers: HeaderMap, state: Arc<AppState>) {
    let (sink, mut receiver) = socket.split();
    let (conn_id, rx) = state.gateway.accept_connection(&headers);
    let mut writer = tokio::spawn(writer_task(sink, rx));

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.gateway.touch(conn_id);
                    state.gateway.handle_message(conn_id, text.as_str());
                }
                Some(Ok(Message::Pong(_))) => state.gateway.touch(conn_id),
                Some(Ok(Message::Ping(_))) => { /* axum auto-pongs */ }
                Some(Ok(Message::Binary(_))) => {
                    debug!(conn_id = %conn_id, "binary frame ignored");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(conn_id = %conn_id, reason = ?frame, "client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, "ws recv error: {e}");
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!(conn_id = %conn_id, "writer finished");
                break;
            }
        }
    }

    writer.abort();
    state.gateway.disconnect(conn_id);
}

/// Owns the sink. Ends when the queue closes (connection unregistered) or
/// the socket stops accepting writes.
async fn writer_task(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = rx.recv().await {
        let msg = match frame {
            Outbound::Text(text) => Message::Text(text.to_string().into()),
            Outbound::Ping => Message::Ping(Vec::new().into()),
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.to_string().into(),
                    })))
                    .await;
                return;
            }
        };
        if sink.send(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
