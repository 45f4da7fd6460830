//! Ports the domain service is constructed with. Adapters live in
//! agora-infra (Postgres, Redis, Kafka, HTTP identity) and agora-gateway
//! (the connection registry implements [`RealtimePush`]); tests use
//! in-memory fakes.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use agora_types::api::Profile;
use agora_types::events::{BrokerEvent, ServerEnvelope};
use agora_types::models::{Conversation, Message, ReactionKind, ReactionMap, User};

/// One conversation in a user's list, with the per-user read state joined in.
#[derive(Debug, Clone)]
pub struct ConversationListRow {
    pub conversation: Conversation,
    pub participant_ids: Vec<Uuid>,
    pub unread_count: i64,
    pub bookmarked: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Persistence gateway. The backing store is the single source of truth for
/// messages, reactions and participants, and the only place requiring
/// transactional atomicity.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn user(&self, id: Uuid) -> Result<Option<User>>;
    async fn upsert_user(&self, user: &User) -> Result<()>;

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    /// Service-level lookup treating the unordered participant pair as the
    /// effective key of a direct conversation.
    async fn find_direct_between(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>>;
    async fn group_name_taken(&self, creator_id: Uuid, name: &str) -> Result<bool>;
    /// Inserts the conversation and its initial participants atomically.
    async fn create_conversation(
        &self,
        conversation: &Conversation,
        participant_ids: &[Uuid],
    ) -> Result<()>;

    async fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>>;
    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;
    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;
    /// Distinct users sharing at least one conversation with `user_id`,
    /// excluding the user. Drives presence fan-out.
    async fn co_participant_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationListRow>>;

    async fn insert_message(&self, message: &Message) -> Result<()>;
    async fn message(&self, id: Uuid) -> Result<Option<Message>>;
    /// Newest-first page, ordered by (created_at, id) descending.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Message>>;
    /// Marks every unread message from other senders read and bumps the
    /// participant's last_read_at, atomically. Returns the read timestamp.
    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<DateTime<Utc>>;
    /// Inserts the (message, user, kind) row if absent, deletes it if
    /// present, and returns the message's resulting reaction map.
    async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        kind: ReactionKind,
    ) -> Result<ReactionMap>;
}

/// Best-effort key/value + online-set gateway. Implementations log failures
/// internally and degrade to "always miss" — the cache is a latency
/// optimization, never a correctness dependency, which is why nothing here
/// returns a Result.
#[async_trait]
pub trait CacheGateway: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
    async fn delete(&self, key: &str);

    /// Idempotent: re-adding a present id is a no-op.
    async fn add_online(&self, user_id: Uuid);
    /// Idempotent: re-removing an absent id is a no-op.
    async fn remove_online(&self, user_id: Uuid);
    async fn is_online(&self, user_id: Uuid) -> bool;
}

/// Fire-and-forget publisher for downstream notification consumers. Callers
/// log and swallow the error: notify failures never fail the commit.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &BrokerEvent) -> Result<()>;
}

/// Client for the remote identity service. A 404 is `Ok(None)`, not an error.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn profile(&self, id: Uuid) -> Result<Option<Profile>>;
    async fn profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>>;
}

/// Push access to this instance's live sockets. Implemented by the
/// connection registry; `send` returns false when the user has no local
/// connection (some other instance may have it — that is fine).
#[async_trait]
pub trait RealtimePush: Send + Sync {
    async fn send(&self, user_id: Uuid, envelope: ServerEnvelope) -> bool;
    async fn broadcast(&self, recipients: &[Uuid], envelope: ServerEnvelope);
}
