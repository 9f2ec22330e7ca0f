//! Client connection registry.
//!
//! Tracks every live client WebSocket per user so control events (presence,
//! broadcast messages) can be delivered to all of a user's connections. Each
//! connection gets its own bounded mpsc channel; the connection task owns the
//! receiving end and is the only writer to its socket.

use dashmap::DashMap;
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use cubby_protocol::GatewayEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// A sender for events to one specific client connection.
pub type ClientSender = mpsc::Sender<GatewayEvent>;

/// Registry of client connections, keyed by user id.
#[derive(Default)]
pub struct Hub {
    connections: DashMap<String, Vec<(u64, ClientSender)>>,
    conn_seq: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for a user.
    ///
    /// Returns the receiver the connection task drains, a sender feeding it
    /// (for relay tasks), the connection id, and whether this made the user
    /// come online (first connection).
    pub fn register(
        &self,
        user_id: &str,
    ) -> (mpsc::Receiver<GatewayEvent>, ClientSender, u64, bool) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.conn_seq.fetch_add(1, Ordering::SeqCst);
        let mut conns = self.connections.entry(user_id.to_string()).or_default();
        let came_online = conns.is_empty();
        conns.push((conn_id, tx.clone()));
        info!("registered connection {conn_id} for user {user_id}");
        (rx, tx, conn_id, came_online)
    }

    /// Unregister a connection. Returns true when this was the user's last
    /// connection (they went offline).
    pub fn unregister(&self, user_id: &str, conn_id: u64) -> bool {
        let mut went_offline = false;
        if let Some(mut conns) = self.connections.get_mut(user_id) {
            conns.retain(|(id, _)| *id != conn_id);
            went_offline = conns.is_empty();
            info!("unregistered connection {conn_id} for user {user_id}");
        }
        self.connections.retain(|_, v| !v.is_empty());
        went_offline
    }

    /// Send an event to every connection of one user.
    pub async fn send_to_user(&self, user_id: &str, event: GatewayEvent) {
        let senders: Vec<ClientSender> = match self.connections.get(user_id) {
            Some(conns) => conns.iter().map(|(_, tx)| tx.clone()).collect(),
            None => return,
        };
        for tx in senders {
            if tx.send(event.clone()).await.is_err() {
                warn!("dropped event for a closed connection of user {user_id}");
            }
        }
    }

    /// Send an event to every connected user.
    pub async fn broadcast(&self, event: GatewayEvent) {
        let users: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for user_id in users {
            self.send_to_user(&user_id, event.clone()).await;
        }
    }

    /// Whether the user currently has at least one connection.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections
            .get(user_id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    /// Total number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }
}
