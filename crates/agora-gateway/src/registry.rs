use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use agora_chat::ports::RealtimePush;
use agora_types::events::ServerEnvelope;

/// What the send half of a connection pulls off its queue.
#[derive(Debug)]
pub enum Outbound {
    Envelope(ServerEnvelope),
    /// A newer connection for the same user registered; emit close code 4000
    /// and shut down.
    Superseded,
}

/// Tracks this instance's live sockets: at most one connection per user,
/// last connection wins.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// user_id -> (conn_id, sender). The conn_id guards teardown so a
    /// superseded connection never unregisters its replacement.
    connections: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<Outbound>)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection for `user_id`. Any previous connection is told
    /// it has been superseded. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .inner
            .connections
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        if let Some((_, old_tx)) = previous {
            let _ = old_tx.send(Outbound::Superseded);
        }
        (conn_id, rx)
    }

    /// Remove the connection, but only if `conn_id` still owns the entry.
    /// Returns whether anything was removed — the caller announces the user
    /// offline only on `true`.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get(&user_id) {
            Some((current, _)) if *current == conn_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimePush for ConnectionRegistry {
    /// False when the user has no connection on this instance; another
    /// instance may still hold one.
    async fn send(&self, user_id: Uuid, envelope: ServerEnvelope) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&user_id) {
            Some((_, tx)) => tx.send(Outbound::Envelope(envelope)).is_ok(),
            None => false,
        }
    }

    async fn broadcast(&self, recipients: &[Uuid], envelope: ServerEnvelope) {
        let connections = self.inner.connections.read().await;
        for user_id in recipients {
            if let Some((_, tx)) = connections.get(user_id) {
                let _ = tx.send(Outbound::Envelope(envelope.clone()));
            }
        }
    }
}
