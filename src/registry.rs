//! Connection Registry (C2): the live-connection roster. Holds exactly one
//! `Client` record per open node connection and owns every sender handle —
//! all outbound sends to a node flow through here, never directly from the
//! dispatcher or router.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::model::NodeStatus;

/// Bound on a single node's outbound queue. A node that can't keep up stalls
/// its own writer task; it must never block sends to other nodes (§5).
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Everything that can flow out to a node over its writer task: either a
/// JSON application frame, or a raw WebSocket control frame. Keeping both on
/// one channel preserves the per-connection ordering guarantee (§5) — a
/// health probe's `Ping` never jumps ahead of or behind queued JSON frames.
pub enum OutboundFrame {
    Json(Value),
    Ping(Vec<u8>),
}

/// A single connected node, as seen by the rest of the process. Cloning is
/// cheap (an `mpsc::Sender` clone plus owned scalars) so snapshots can be
/// taken without holding the registry lock.
#[derive(Clone)]
pub struct Client {
    pub node_id: Uuid,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub capabilities: HashMap<String, String>,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    outbound: mpsc::Sender<OutboundFrame>,
    pong_notify: Arc<Notify>,
}

impl Client {
    /// Whether the dispatcher may offer this client new work (§4.5).
    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    /// Queues `frame` for delivery without blocking the caller. A full or
    /// closed channel is logged and otherwise ignored — a stuck or gone peer
    /// must never wedge whoever is fanning the message out (§5).
    pub fn send(&self, frame: Value) {
        self.enqueue(OutboundFrame::Json(frame));
    }

    /// Queues a WebSocket `Ping` control frame — the actual liveness probe
    /// the health monitor issues (§4.4), not an in-memory presence check.
    pub fn send_ping(&self, payload: Vec<u8>) {
        self.enqueue(OutboundFrame::Ping(payload));
    }

    /// A handle the health monitor can await for the matching `Pong` to
    /// arrive. [`Registry::notify_pong`] (driven by the connection's read
    /// loop) wakes it. `Notify` buffers a single permit, so it's safe to
    /// call this before or after the ping is actually sent.
    pub fn pong_signal(&self) -> Arc<Notify> {
        self.pong_notify.clone()
    }

    fn enqueue(&self, frame: OutboundFrame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(node_id = %self.node_id, "outbound channel full, dropping frame");
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(node_id = %self.node_id, "outbound channel closed, dropping frame");
            },
        }
    }
}

/// A freshly accepted connection's writer-side handle, returned by
/// [`Registry::connect`] so the caller can drive the dedicated writer task
/// that drains it onto the socket.
pub struct Connection {
    pub node_id: Uuid,
    pub outbound_rx: mpsc::Receiver<OutboundFrame>,
}

/// The live roster. A single `RwLock` guards the map — the teacher's
/// registry has no precedent for sharded locking, and periodic full scans
/// (health, dispatch) dominate the access pattern here, not point lookups
/// under contention.
#[derive(Default)]
pub struct Registry {
    clients: RwLock<HashMap<Uuid, Client>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection under a freshly minted node id and
    /// returns the receiver half the caller must drain onto the wire.
    pub async fn connect(&self) -> Connection {
        let node_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let client = Client {
            node_id,
            display_name: None,
            tags: Vec::new(),
            capabilities: HashMap::new(),
            status: NodeStatus::Online,
            last_seen: Utc::now(),
            outbound: tx,
            pong_notify: Arc::new(Notify::new()),
        };
        self.clients.write().await.insert(node_id, client);
        Connection { node_id, outbound_rx: rx }
    }

    /// Removes the connection's record entirely. Callers are responsible
    /// for persisting the OFFLINE transition before or after this call —
    /// the registry itself only tracks *live* connections (§4.2: removing
    /// the durable node row on disconnect is not required, but the
    /// registry's own bookkeeping is not durable).
    pub async fn disconnect(&self, node_id: Uuid) {
        self.clients.write().await.remove(&node_id);
    }

    /// Applies a `node.hello` announcement: updates cached metadata and
    /// bumps `last_seen`.
    pub async fn apply_hello(
        &self,
        node_id: Uuid,
        display_name: Option<String>,
        tags: Vec<String>,
        capabilities: HashMap<String, String>,
    ) {
        if let Some(client) = self.clients.write().await.get_mut(&node_id) {
            client.display_name = display_name;
            client.tags = tags;
            client.capabilities = capabilities;
            client.last_seen = Utc::now();
        }
    }

    pub async fn set_status(&self, node_id: Uuid, status: NodeStatus) {
        if let Some(client) = self.clients.write().await.get_mut(&node_id) {
            client.status = status;
        }
    }

    /// Marks the client seen now and, unless it is currently BUSY (an
    /// in-flight job status update should not clobber that), resets its
    /// status to ONLINE (§4.3).
    pub async fn touch(&self, node_id: Uuid) {
        if let Some(client) = self.clients.write().await.get_mut(&node_id) {
            client.last_seen = Utc::now();
            if client.status != NodeStatus::Busy {
                client.status = NodeStatus::Online;
            }
        }
    }

    pub async fn get(&self, node_id: Uuid) -> Option<Client> {
        self.clients.read().await.get(&node_id).cloned()
    }

    /// Wakes whoever is awaiting this client's [`Client::pong_signal`] —
    /// called from the connection's read loop on an inbound `Pong` frame.
    pub async fn notify_pong(&self, node_id: Uuid) {
        if let Some(client) = self.clients.read().await.get(&node_id) {
            client.pong_notify.notify_one();
        }
    }

    /// A point-in-time snapshot of every live client, safe to iterate over
    /// without holding the lock (dispatcher and health monitor ticks).
    pub async fn snapshot(&self) -> Vec<Client> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn send_to(&self, node_id: Uuid, frame: Value) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&node_id) {
            Some(client) => {
                client.send(frame);
                true
            },
            None => false,
        }
    }

    pub async fn broadcast_except(&self, exclude: Option<Uuid>, frame: Value) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            if Some(client.node_id) != exclude {
                client.send(frame.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_registers_a_fresh_online_client() {
        let registry = Registry::new();
        let conn = registry.connect().await;

        let client = registry.get(conn.node_id).await.unwrap();
        assert_eq!(client.status, NodeStatus::Online);
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn disconnect_removes_the_client() {
        let registry = Registry::new();
        let conn = registry.connect().await;
        registry.disconnect(conn.node_id).await;
        assert!(registry.get(conn.node_id).await.is_none());
    }

    #[tokio::test]
    async fn touch_preserves_busy_status() {
        let registry = Registry::new();
        let conn = registry.connect().await;
        registry.set_status(conn.node_id, NodeStatus::Busy).await;
        registry.touch(conn.node_id).await;
        assert_eq!(registry.get(conn.node_id).await.unwrap().status, NodeStatus::Busy);
    }

    #[tokio::test]
    async fn apply_hello_updates_cached_metadata() {
        let registry = Registry::new();
        let conn = registry.connect().await;
        registry
            .apply_hello(
                conn.node_id,
                Some("worker-1".to_string()),
                vec!["gpu".to_string()],
                HashMap::new(),
            )
            .await;

        let client = registry.get(conn.node_id).await.unwrap();
        assert_eq!(client.display_name.as_deref(), Some("worker-1"));
        assert_eq!(client.tags, vec!["gpu".to_string()]);
    }
}
