//! Realtime channel message formats.
//!
//! Client → server:
//!
//! ```json
//! {"type": "subscribe", "order_id": "ORD-1"}
//! {"type": "unsubscribe", "order_id": "ORD-1"}
//! {"type": "get_status", "order_id": "ORD-1"}
//! {"type": "ping"}
//! ```
//!
//! Server → client:
//!
//! ```json
//! {"type": "order_update", "order_id": "ORD-1", "data": {...}}
//! {"type": "pong"}
//! {"type": "error", "order_id": "ORD-1", "error": "order not found"}
//! ```

use serde::{Deserialize, Serialize};

use crate::models::order::OrderSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { order_id: String },
    Unsubscribe { order_id: String },
    GetStatus { order_id: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    OrderUpdate {
        order_id: String,
        data: OrderSnapshot,
    },
    Pong,
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<String>,
        error: String,
    },
}

impl ServerMessage {
    pub fn order_update(snapshot: OrderSnapshot) -> Self {
        ServerMessage::OrderUpdate {
            order_id: snapshot.order_id.clone(),
            data: snapshot,
        }
    }

    pub fn error(order_id: Option<&str>, error: impl Into<String>) -> Self {
        ServerMessage::Error {
            order_id: order_id.map(str::to_string),
            error: error.into(),
        }
    }
}
