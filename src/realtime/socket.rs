//! WebSocket endpoint for order status updates.
//!
//! Endpoint: `GET /ws?client_id=web-1`
//!
//! Each connection runs two tasks: a writer that drains the connection's
//! outbound buffer and sends a heartbeat ping every 30 seconds, and a reader
//! that parses client messages and forwards them to the notifier. A
//! connection that sends nothing (not even a pong) for 60 seconds is closed.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;

use super::notifier::{ConnectionId, NotifierHandle};
use super::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

/// Largest inbound message accepted, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub client_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let notifier = state.notifier.clone();
    let client_id = params.client_id.unwrap_or_else(|| "anonymous".to_string());

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, client_id, notifier))
}

async fn handle_socket(socket: WebSocket, client_id: String, notifier: NotifierHandle) {
    let (conn_id, mut outbound) = match notifier.register(client_id.clone()).await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::error!(%client_id, error = %e, "Failed to register realtime connection");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                message = outbound.recv() => {
                    // Sender dropped: the notifier evicted or unregistered us
                    let Some(message) = message else {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(conn_id, error = %e, "Failed to encode realtime message");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader = notifier.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    tracing::debug!(conn_id, error = %e, "Realtime connection read error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::info!(conn_id, "Realtime connection idle past read deadline");
                    break;
                }
            };

            match frame {
                Message::Text(text) => handle_client_text(&reader, conn_id, text.as_str()).await,
                Message::Close(_) => break,
                // Pings, pongs and binary frames only refresh the deadline
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    if let Err(e) = notifier.unregister(conn_id).await {
        tracing::warn!(conn_id, error = %e, "Failed to unregister realtime connection");
    }
}

async fn handle_client_text(notifier: &NotifierHandle, conn_id: ConnectionId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "Invalid realtime message");
            let _ = notifier
                .deliver(conn_id, ServerMessage::error(None, "invalid message"))
                .await;
            return;
        }
    };

    let result = match &message {
        ClientMessage::Subscribe { order_id } => notifier.subscribe(conn_id, order_id).await,
        ClientMessage::Unsubscribe { order_id } => notifier.unsubscribe(conn_id, order_id).await,
        ClientMessage::GetStatus { order_id } => notifier.send_status(conn_id, order_id).await,
        ClientMessage::Ping => notifier.deliver(conn_id, ServerMessage::Pong).await,
    };

    if let Err(e) = result {
        tracing::warn!(conn_id, ?message, error = %e, "Failed to handle realtime message");
    }
}
