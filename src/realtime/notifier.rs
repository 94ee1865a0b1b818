//! Realtime notifier actor.
//!
//! One task owns every live connection and its subscribed order ids. Other
//! tasks talk to it only through `NotifierHandle`, which turns each call into
//! a `Command` on the actor's channel.
//!
//! # Slow consumers
//!
//! Each connection has a bounded outbound buffer. A send that finds the buffer
//! full (or the receiver gone) evicts the connection: its sender is dropped,
//! its writer task drains and exits, and it receives nothing further.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::error::AppError;
use crate::realtime::protocol::ServerMessage;
use crate::services::order_store::OrderStore;

/// Outbound messages buffered per connection before it counts as dead.
pub const OUTBOUND_BUFFER: usize = 256;

const COMMAND_BUFFER: usize = 1024;

pub type ConnectionId = u64;

enum Command {
    Register {
        conn_id: ConnectionId,
        client_id: String,
        sender: mpsc::Sender<ServerMessage>,
    },
    Unregister {
        conn_id: ConnectionId,
    },
    Subscribe {
        conn_id: ConnectionId,
        order_id: String,
    },
    Unsubscribe {
        conn_id: ConnectionId,
        order_id: String,
    },
    Deliver {
        conn_id: ConnectionId,
        message: ServerMessage,
    },
    Broadcast {
        order_id: String,
        message: ServerMessage,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

struct Subscriber {
    client_id: String,
    sender: mpsc::Sender<ServerMessage>,
    orders: HashSet<String>,
}

struct Notifier {
    subscribers: HashMap<ConnectionId, Subscriber>,
}

impl Notifier {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        tracing::info!("Realtime notifier stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                conn_id,
                client_id,
                sender,
            } => {
                self.subscribers.insert(
                    conn_id,
                    Subscriber {
                        client_id,
                        sender,
                        orders: HashSet::new(),
                    },
                );
                tracing::info!(
                    conn_id,
                    total_connections = self.subscribers.len(),
                    "Realtime connection registered"
                );
            }
            Command::Unregister { conn_id } => {
                if let Some(subscriber) = self.subscribers.remove(&conn_id) {
                    tracing::info!(
                        conn_id,
                        client_id = %subscriber.client_id,
                        total_connections = self.subscribers.len(),
                        "Realtime connection unregistered"
                    );
                }
            }
            Command::Subscribe { conn_id, order_id } => {
                if let Some(subscriber) = self.subscribers.get_mut(&conn_id) {
                    tracing::debug!(conn_id, %order_id, "Subscribed");
                    subscriber.orders.insert(order_id);
                }
            }
            Command::Unsubscribe { conn_id, order_id } => {
                if let Some(subscriber) = self.subscribers.get_mut(&conn_id) {
                    subscriber.orders.remove(&order_id);
                }
            }
            Command::Deliver { conn_id, message } => {
                let delivered = match self.subscribers.get(&conn_id) {
                    Some(subscriber) => subscriber.sender.try_send(message).is_ok(),
                    None => true,
                };
                if !delivered {
                    self.evict(conn_id);
                }
            }
            Command::Broadcast { order_id, message } => {
                let mut sent = 0usize;
                let mut dead = Vec::new();

                for (conn_id, subscriber) in &self.subscribers {
                    if !subscriber.orders.contains(&order_id) {
                        continue;
                    }
                    match subscriber.sender.try_send(message.clone()) {
                        Ok(()) => sent += 1,
                        Err(_) => dead.push(*conn_id),
                    }
                }

                for conn_id in dead {
                    self.evict(conn_id);
                }

                tracing::debug!(%order_id, recipients = sent, "Order status broadcast");
            }
            Command::Count { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn evict(&mut self, conn_id: ConnectionId) {
        if let Some(subscriber) = self.subscribers.remove(&conn_id) {
            tracing::warn!(
                conn_id,
                client_id = %subscriber.client_id,
                "Evicting realtime connection with full or closed buffer"
            );
        }
    }
}

/// Cloneable handle to the notifier actor.
#[derive(Clone)]
pub struct NotifierHandle {
    commands: mpsc::Sender<Command>,
    store: Arc<dyn OrderStore>,
    next_conn_id: Arc<AtomicU64>,
}

impl NotifierHandle {
    /// Start the actor on the current runtime.
    pub fn spawn(store: Arc<dyn OrderStore>) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let notifier = Notifier {
            subscribers: HashMap::new(),
        };
        tokio::spawn(notifier.run(receiver));

        Self {
            commands,
            store,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn send(&self, command: Command) -> Result<(), AppError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::Task("realtime notifier is not running".to_string()))
    }

    /// Register a connection and return its id plus the receiving end of its
    /// outbound buffer.
    pub async fn register(
        &self,
        client_id: impl Into<String>,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerMessage>), AppError> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER);

        self.send(Command::Register {
            conn_id,
            client_id: client_id.into(),
            sender,
        })
        .await?;

        Ok((conn_id, receiver))
    }

    pub async fn unregister(&self, conn_id: ConnectionId) -> Result<(), AppError> {
        self.send(Command::Unregister { conn_id }).await
    }

    /// Subscribe and immediately push the order's current snapshot.
    pub async fn subscribe(&self, conn_id: ConnectionId, order_id: &str) -> Result<(), AppError> {
        self.send(Command::Subscribe {
            conn_id,
            order_id: order_id.to_string(),
        })
        .await?;

        self.send_status(conn_id, order_id).await
    }

    pub async fn unsubscribe(&self, conn_id: ConnectionId, order_id: &str) -> Result<(), AppError> {
        self.send(Command::Unsubscribe {
            conn_id,
            order_id: order_id.to_string(),
        })
        .await
    }

    /// Reply to one connection with the order's snapshot, or an error message
    /// when the order does not exist.
    pub async fn send_status(&self, conn_id: ConnectionId, order_id: &str) -> Result<(), AppError> {
        let message = match self.store.find_order(order_id).await? {
            Some(order) => ServerMessage::order_update(order.snapshot()),
            None => ServerMessage::error(Some(order_id), "order not found"),
        };

        self.deliver(conn_id, message).await
    }

    pub async fn deliver(&self, conn_id: ConnectionId, message: ServerMessage) -> Result<(), AppError> {
        self.send(Command::Deliver { conn_id, message }).await
    }

    /// Re-read the order and push its snapshot to every subscriber of it.
    ///
    /// # Errors
    ///
    /// - `OrderNotFound`: the order does not exist
    /// - `Database`: the snapshot could not be read
    pub async fn broadcast_order_status(&self, order_id: &str) -> Result<(), AppError> {
        let order = self
            .store
            .find_order(order_id)
            .await?
            .ok_or(AppError::OrderNotFound)?;

        self.send(Command::Broadcast {
            order_id: order_id.to_string(),
            message: ServerMessage::order_update(order.snapshot()),
        })
        .await
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> Result<usize, AppError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Count { reply }).await?;
        response
            .await
            .map_err(|_| AppError::Task("realtime notifier dropped the reply".to_string()))
    }
}
