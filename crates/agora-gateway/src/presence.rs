//! Cross-instance presence. Connect/disconnect flips the shared online set
//! and publishes on the presence channel; every instance (this one included)
//! consumes the channel and notifies whichever co-participants it is holding
//! sockets for.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use agora_chat::ports::{CacheGateway, RealtimePush};
use agora_types::events::{PresenceEvent, ServerEnvelope};

/// Publisher side of the presence channel. Implemented over Redis pub/sub in
/// agora-infra.
#[async_trait]
pub trait PresencePublisher: Send + Sync {
    async fn publish(&self, event: &PresenceEvent) -> Result<()>;
}

/// Who shares a conversation with whom. The Postgres store implements this
/// next to its chat queries.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    async fn co_participants(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
}

pub struct PresencePropagator {
    cache: Arc<dyn CacheGateway>,
    publisher: Arc<dyn PresencePublisher>,
    push: Arc<dyn RealtimePush>,
    directory: Arc<dyn PresenceDirectory>,
}

impl PresencePropagator {
    pub fn new(
        cache: Arc<dyn CacheGateway>,
        publisher: Arc<dyn PresencePublisher>,
        push: Arc<dyn RealtimePush>,
        directory: Arc<dyn PresenceDirectory>,
    ) -> Self {
        Self {
            cache,
            publisher,
            push,
            directory,
        }
    }

    /// The connection loop calls this once per registered connection.
    pub async fn connected(&self, user_id: Uuid) {
        self.cache.add_online(user_id).await;
        self.publish_or_log(PresenceEvent::Online { user_id }).await;
    }

    /// Called only when the closing connection still owned the registry
    /// entry — a superseded connection must not announce the user offline.
    pub async fn disconnected(&self, user_id: Uuid) {
        self.cache.remove_online(user_id).await;
        self.publish_or_log(PresenceEvent::Offline { user_id }).await;
    }

    /// Fan a presence event out to local sockets of the user's
    /// co-participants. `send` returning false just means the peer lives on
    /// another instance; that instance handles them.
    pub async fn handle_event(&self, event: PresenceEvent) -> Result<()> {
        let user_id = event.user_id();
        let peers = self.directory.co_participants(user_id).await?;
        let update = ServerEnvelope::PresenceUpdate {
            user_id,
            online: event.is_online(),
        };
        for peer in peers {
            self.push.send(peer, update.clone()).await;
        }
        Ok(())
    }

    async fn publish_or_log(&self, event: PresenceEvent) {
        if let Err(err) = self.publisher.publish(&event).await {
            warn!(user_id = %event.user_id(), error = %err, "presence publish failed");
        }
    }
}
