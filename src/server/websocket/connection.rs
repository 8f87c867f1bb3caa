//! WebSocket connection manager.
//!
//! Tracks every open socket and gives each one a [`PeerConnection`], the
//! message-level link job actions use to talk to workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::messages::ServerMessage;
use crate::pool::{LinkError, WorkerLink};
use crate::server::auth::Role;
use crate::server::metrics;

const OUTGOING_CAPACITY: usize = 32;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One open socket.
///
/// Outgoing frames go through a bounded channel drained by the socket's
/// writer task. Incoming `ack` frames and `job.*` frames are routed back
/// here by the handler.
pub struct PeerConnection {
    id: Uuid,
    subject: String,
    role: Role,
    sender: mpsc::Sender<ServerMessage>,
    next_ack: AtomicU64,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    closed: AtomicBool,
}

impl PeerConnection {
    fn new(subject: String, role: Role, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            role,
            sender,
            next_ack: AtomicU64::new(1),
            pending_acks: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a frame for the peer.
    pub async fn send(&self, message: ServerMessage) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.sender
            .send(message)
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Complete the request waiting on `ack_id`. Returns false for unknown
    /// or already answered ids.
    pub fn resolve_ack(&self, ack_id: u64, payload: Value) -> bool {
        match lock(&self.pending_acks).remove(&ack_id) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Hand an incoming frame to whoever subscribed to its type.
    pub fn deliver(&self, msg_type: &str, payload: Value) -> bool {
        let mut subscriptions = lock(&self.subscriptions);
        let Some(tx) = subscriptions.get(msg_type) else {
            return false;
        };
        if tx.send(payload).is_err() {
            subscriptions.remove(msg_type);
            return false;
        }
        true
    }

    /// Mark the link closed. Requests still waiting for an answer fail with
    /// [`LinkError::Dropped`] and subscribers see their stream end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.pending_acks).clear();
        lock(&self.subscriptions).clear();
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.pending_acks).len()
    }
}

#[async_trait]
impl WorkerLink for PeerConnection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    async fn request(&self, msg_type: &str, payload: Value) -> Result<Value, LinkError> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_acks).insert(ack_id, tx);

        let message = ServerMessage::new(msg_type, payload).with_ack(ack_id);
        if let Err(e) = self.send(message).await {
            lock(&self.pending_acks).remove(&ack_id);
            return Err(e);
        }
        debug!("Sent {} (ack {}) to {}", msg_type, ack_id, self.id);

        rx.await
            .map_err(|_| LinkError::Dropped(msg_type.to_string()))
    }

    async fn emit(&self, msg_type: &str, payload: Value) -> Result<(), LinkError> {
        self.send(ServerMessage::new(msg_type, payload)).await
    }

    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            lock(&self.subscriptions).insert(channel.to_string(), tx);
        }
        rx
    }

    fn unsubscribe(&self, channel: &str) {
        lock(&self.subscriptions).remove(channel);
    }
}

/// Manages all active WebSocket connections.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Arc<PeerConnection>>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the connection and the receiver for its outgoing frames. The
    /// caller forwards frames from this receiver to the socket.
    pub async fn register(
        &self,
        subject: impl Into<String>,
        role: Role,
    ) -> (Arc<PeerConnection>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let connection = Arc::new(PeerConnection::new(subject.into(), role, tx));

        let mut conns = self.connections.write().await;
        conns.insert(connection.id(), Arc::clone(&connection));
        metrics::set_ws_connections(conns.len());

        (connection, rx)
    }

    /// Unregister a connection (called on disconnect).
    pub async fn unregister(&self, id: Uuid) -> Option<Arc<PeerConnection>> {
        let mut conns = self.connections.write().await;
        let removed = conns.remove(&id);
        metrics::set_ws_connections(conns.len());
        removed
    }
}
