use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use agora_types::api::{ConversationSummary, CreateGroupRequest};
use agora_types::events::{BrokerEvent, GroupChange, ServerEnvelope};
use agora_types::models::{Conversation, ConversationKind, Message, ReactionKind, User};

use crate::error::ChatError;
use crate::ports::{CacheGateway, ChatStore, EventPublisher, IdentityClient, RealtimePush};

pub const MAX_MESSAGE_CHARS: usize = 2000;

fn conversation_list_key(user_id: Uuid) -> String {
    format!("conversations:{user_id}")
}

/// Chat domain service. All collaborators are injected at construction —
/// the gateways are leaves, the connection registry is reached through the
/// [`RealtimePush`] port.
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    cache: Arc<dyn CacheGateway>,
    events: Arc<dyn EventPublisher>,
    identity: Arc<dyn IdentityClient>,
    push: Arc<dyn RealtimePush>,
    cache_ttl: Duration,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        cache: Arc<dyn CacheGateway>,
        events: Arc<dyn EventPublisher>,
        identity: Arc<dyn IdentityClient>,
        push: Arc<dyn RealtimePush>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            identity,
            push,
            cache_ttl,
        }
    }

    // -- Conversations --

    /// Cache-aside read of the user's conversation list. A cache outage or a
    /// corrupt entry falls through to the store.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let key = conversation_list_key(user_id);
        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str::<Vec<ConversationSummary>>(&raw) {
                Ok(cached) => return Ok(cached),
                Err(err) => warn!(%user_id, error = %err, "corrupt cached conversation list, refetching"),
            }
        }

        let rows = self.store.list_conversations(user_id).await?;
        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = row.conversation;
            let (name, peer_online) = match conversation.kind {
                ConversationKind::Group => (conversation.name.clone(), None),
                ConversationKind::Direct => {
                    let peer = row
                        .participant_ids
                        .iter()
                        .copied()
                        .find(|id| *id != user_id);
                    match peer {
                        Some(peer) => {
                            let display = self.store.user(peer).await?.map(|u| u.display_name);
                            (display, Some(self.cache.is_online(peer).await))
                        }
                        None => (None, None),
                    }
                }
            };
            summaries.push(ConversationSummary {
                id: conversation.id,
                kind: conversation.kind,
                name,
                description: conversation.description,
                category: conversation.category,
                creator_id: conversation.creator_id,
                is_live: conversation.is_live,
                is_private: conversation.is_private,
                is_resolved: conversation.is_resolved,
                tags: conversation.tags,
                participant_ids: row.participant_ids,
                unread_count: row.unread_count,
                bookmarked: row.bookmarked,
                last_activity_at: row.last_activity_at,
                peer_online,
            });
        }

        match serde_json::to_string(&summaries) {
            Ok(raw) => self.cache.set(&key, &raw, self.cache_ttl).await,
            Err(err) => warn!(%user_id, error = %err, "failed to encode conversation list for cache"),
        }

        Ok(summaries)
    }

    /// Idempotent: an existing direct conversation between exactly this pair
    /// is returned instead of creating a second one.
    pub async fn create_or_get_direct(&self, a: Uuid, b: Uuid) -> Result<Conversation, ChatError> {
        if a == b {
            return Err(ChatError::BadRequest(
                "a direct conversation needs two distinct users".into(),
            ));
        }
        self.resolve_user(a).await?;
        self.resolve_user(b).await?;

        if let Some(existing) = self.store.find_direct_between(a, b).await? {
            return self
                .store
                .conversation(existing)
                .await?
                .ok_or(ChatError::NotFound);
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            name: None,
            description: None,
            category: None,
            creator_id: Some(a),
            is_live: false,
            is_private: true,
            is_resolved: false,
            tags: Vec::new(),
            created_at: Utc::now(),
        };
        self.store
            .create_conversation(&conversation, &[a, b])
            .await?;
        self.invalidate_lists(&[a, b]).await;
        Ok(conversation)
    }

    pub async fn create_group(
        &self,
        creator: Uuid,
        req: CreateGroupRequest,
    ) -> Result<Conversation, ChatError> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(ChatError::BadRequest("group name must not be empty".into()));
        }

        // Dedupe the member list with the creator.
        let members: BTreeSet<Uuid> = req
            .member_ids
            .iter()
            .copied()
            .chain(std::iter::once(creator))
            .collect();
        if members.len() < 2 {
            return Err(ChatError::BadRequest(
                "a group needs at least two distinct members".into(),
            ));
        }

        // All-or-nothing identity resolution before anything is written.
        let member_ids: Vec<Uuid> = members.into_iter().collect();
        self.resolve_users(&member_ids).await?;

        if self.store.group_name_taken(creator, &name).await? {
            return Err(ChatError::Conflict(format!(
                "a group named {name:?} already exists for this creator"
            )));
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            name: Some(name),
            description: req.description,
            category: req.category,
            creator_id: Some(creator),
            is_live: false,
            is_private: req.is_private,
            is_resolved: false,
            tags: req.tags,
            created_at: Utc::now(),
        };
        self.store
            .create_conversation(&conversation, &member_ids)
            .await?;
        self.invalidate_lists(&member_ids).await;
        self.publish_or_log(BrokerEvent::GroupUpdated {
            conversation_id: conversation.id,
            actor_id: creator,
            change: GroupChange::Created,
        })
        .await;
        Ok(conversation)
    }

    pub async fn add_participant(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        target: Uuid,
    ) -> Result<(), ChatError> {
        let conversation = self.require_group_creator(conversation_id, requester).await?;
        self.resolve_user(target).await?;
        self.store.add_participant(conversation_id, target).await?;

        let mut affected = self.store.participant_ids(conversation_id).await?;
        if !affected.contains(&target) {
            affected.push(target);
        }
        self.invalidate_lists(&affected).await;
        self.publish_or_log(BrokerEvent::GroupUpdated {
            conversation_id: conversation.id,
            actor_id: requester,
            change: GroupChange::MemberAdded,
        })
        .await;
        Ok(())
    }

    pub async fn remove_participant(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        target: Uuid,
    ) -> Result<(), ChatError> {
        let conversation = self.require_group_creator(conversation_id, requester).await?;
        if target == requester {
            return Err(ChatError::BadRequest(
                "the creator cannot remove their own membership".into(),
            ));
        }

        // Snapshot before removal so the removed member's cache is cleared too.
        let affected = self.store.participant_ids(conversation_id).await?;
        self.store
            .remove_participant(conversation_id, target)
            .await?;
        self.invalidate_lists(&affected).await;
        self.publish_or_log(BrokerEvent::GroupUpdated {
            conversation_id: conversation.id,
            actor_id: requester,
            change: GroupChange::MemberRemoved,
        })
        .await;
        Ok(())
    }

    // -- Messages --

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ChatError> {
        self.require_participant(conversation_id, user_id).await?;
        let limit = limit.clamp(1, 100);
        let page = page.max(1);
        // Widened before multiplying: page arrives straight off the query
        // string and u32 arithmetic would overflow.
        let offset = u64::from(page - 1) * u64::from(limit);
        Ok(self
            .store
            .list_messages(conversation_id, limit, offset)
            .await?)
    }

    /// Commit phase: persist. Notify phase (only after the commit): cache
    /// invalidation, local broadcast to everyone but the sender, best-effort
    /// broker publish carrying the full recipient list.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        content: String,
        replying_to_message_id: Option<Uuid>,
    ) -> Result<Message, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::BadRequest("message content is empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::BadRequest(format!(
                "message content exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
        self.require_participant(conversation_id, sender_id).await?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content,
            replying_to_message_id,
            reactions: Default::default(),
            read_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_message(&message).await?;

        let participants = self.store.participant_ids(conversation_id).await?;
        let recipients: Vec<Uuid> = participants
            .iter()
            .copied()
            .filter(|id| *id != sender_id)
            .collect();

        self.invalidate_lists(&participants).await;
        self.push
            .broadcast(
                &recipients,
                ServerEnvelope::NewMessage {
                    message: message.clone(),
                },
            )
            .await;
        self.publish_or_log(BrokerEvent::MessageSent {
            conversation_id,
            message_id: message.id,
            sender_id,
            recipient_ids: recipients,
        })
        .await;

        Ok(message)
    }

    /// Transient: nothing persisted, nothing published.
    pub async fn typing(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        typing: bool,
    ) -> Result<(), ChatError> {
        self.require_participant(conversation_id, user_id).await?;
        let recipients: Vec<Uuid> = self
            .store
            .participant_ids(conversation_id)
            .await?
            .into_iter()
            .filter(|id| *id != user_id)
            .collect();
        self.push
            .broadcast(
                &recipients,
                ServerEnvelope::TypingUpdate {
                    conversation_id,
                    user_id,
                    typing,
                },
            )
            .await;
        Ok(())
    }

    /// Marks everything unread read and notifies the other party — never the
    /// reader themself.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), ChatError> {
        self.require_participant(conversation_id, user_id).await?;
        let read_at = self.store.mark_read(conversation_id, user_id).await?;

        self.invalidate_lists(&[user_id]).await;
        let others: Vec<Uuid> = self
            .store
            .participant_ids(conversation_id)
            .await?
            .into_iter()
            .filter(|id| *id != user_id)
            .collect();
        self.push
            .broadcast(
                &others,
                ServerEnvelope::MessagesRead {
                    conversation_id,
                    reader_id: user_id,
                    read_at,
                },
            )
            .await;
        self.publish_or_log(BrokerEvent::MessagesRead {
            conversation_id,
            reader_id: user_id,
            recipient_ids: others,
        })
        .await;
        Ok(())
    }

    // -- Reactions --

    /// Toggle, not set: even numbers of calls restore the original state.
    /// The resulting map is broadcast to all participants, the actor included.
    pub async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        kind: ReactionKind,
    ) -> Result<(), ChatError> {
        let message = self
            .store
            .message(message_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        self.require_participant(message.conversation_id, user_id)
            .await?;

        let reactions = self.store.toggle_reaction(message_id, user_id, kind).await?;
        let participants = self.store.participant_ids(message.conversation_id).await?;
        self.push
            .broadcast(
                &participants,
                ServerEnvelope::ReactionUpdate {
                    conversation_id: message.conversation_id,
                    message_id,
                    reactions,
                },
            )
            .await;
        Ok(())
    }

    // -- Internals --

    async fn require_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), ChatError> {
        if self.store.is_participant(conversation_id, user_id).await? {
            Ok(())
        } else {
            Err(ChatError::Forbidden)
        }
    }

    async fn require_group_creator(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::NotFound)?;
        if conversation.kind != ConversationKind::Group {
            return Err(ChatError::BadRequest(
                "membership can only be managed on group conversations".into(),
            ));
        }
        if conversation.creator_id != Some(requester) {
            return Err(ChatError::Forbidden);
        }
        Ok(conversation)
    }

    /// Lazy replication from the identity service: unknown users are fetched
    /// and cached locally; a 404 blocks the operation with BadRequest, a
    /// transport failure surfaces as Upstream.
    async fn resolve_user(&self, id: Uuid) -> Result<User, ChatError> {
        if let Some(user) = self.store.user(id).await? {
            return Ok(user);
        }
        let profile = self
            .identity
            .profile(id)
            .await
            .map_err(|err| ChatError::Upstream(err.to_string()))?
            .ok_or_else(|| ChatError::BadRequest(format!("unknown user {id}")))?;
        let user = User {
            id: profile.id,
            display_name: profile.display_name,
            avatar_url: profile.avatar_url,
        };
        self.store.upsert_user(&user).await?;
        Ok(user)
    }

    /// Batch form of [`resolve_user`](Self::resolve_user) for group
    /// creation: locally known members are accepted as-is, the rest are
    /// fetched from identity in a single call. Nothing is replicated until
    /// every missing member resolved.
    async fn resolve_users(&self, ids: &[Uuid]) -> Result<(), ChatError> {
        let mut missing = Vec::new();
        for id in ids {
            if self.store.user(*id).await?.is_none() {
                missing.push(*id);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let profiles = self
            .identity
            .profiles(&missing)
            .await
            .map_err(|err| ChatError::Upstream(err.to_string()))?;
        for id in &missing {
            if !profiles.iter().any(|profile| profile.id == *id) {
                return Err(ChatError::BadRequest(format!("unknown user {id}")));
            }
        }
        for profile in &profiles {
            self.store
                .upsert_user(&User {
                    id: profile.id,
                    display_name: profile.display_name.clone(),
                    avatar_url: profile.avatar_url.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Invalidate, never patch: the next list read repopulates the cache.
    async fn invalidate_lists(&self, user_ids: &[Uuid]) {
        for user_id in user_ids {
            self.cache.delete(&conversation_list_key(*user_id)).await;
        }
    }

    /// Notify failures are a separate error channel: logged, never joined
    /// into the primary result.
    async fn publish_or_log(&self, event: BrokerEvent) {
        if let Err(err) = self.events.publish(&event).await {
            warn!(error = %err, "broker publish failed, continuing");
        }
    }
}
