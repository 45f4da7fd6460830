use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use agora_types::api::{CreateGroupRequest, Profile};
use agora_types::events::{BrokerEvent, ServerEnvelope};
use agora_types::models::{
    Conversation, ConversationKind, ConversationParticipant, Message, ReactionKind, ReactionMap,
    User,
};

use crate::error::ChatError;
use crate::ports::{
    CacheGateway, ChatStore, ConversationListRow, EventPublisher, IdentityClient, RealtimePush,
};
use crate::service::ChatService;

// -- In-memory fakes --

#[derive(Default)]
struct StoreInner {
    users: HashMap<Uuid, User>,
    conversations: HashMap<Uuid, Conversation>,
    participants: Vec<ConversationParticipant>,
    messages: Vec<Message>,
    reactions: HashSet<(Uuid, Uuid, ReactionKind)>,
}

#[derive(Default)]
struct MemoryStore {
    inner: Mutex<StoreInner>,
    list_calls: AtomicUsize,
}

impl MemoryStore {
    fn add_user(&self, id: Uuid, name: &str) {
        self.inner.lock().unwrap().users.insert(
            id,
            User {
                id,
                display_name: name.to_string(),
                avatar_url: None,
            },
        );
    }

    fn has_message(&self, id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .any(|m| m.id == id)
    }

    fn message_count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    fn reaction_count(&self) -> usize {
        self.inner.lock().unwrap().reactions.len()
    }

    fn reaction_map(inner: &StoreInner, message_id: Uuid) -> ReactionMap {
        let mut map: ReactionMap = BTreeMap::new();
        for (mid, uid, kind) in &inner.reactions {
            if *mid == message_id {
                map.entry(*kind).or_default().push(*uid);
            }
        }
        for users in map.values_mut() {
            users.sort();
        }
        map
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.lock().unwrap().users.get(&id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .users
            .insert(user.id, user.clone());
        Ok(())
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.inner.lock().unwrap().conversations.get(&id).cloned())
    }

    async fn find_direct_between(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
        let inner = self.inner.lock().unwrap();
        for conversation in inner.conversations.values() {
            if conversation.kind != ConversationKind::Direct {
                continue;
            }
            let members: HashSet<Uuid> = inner
                .participants
                .iter()
                .filter(|p| p.conversation_id == conversation.id)
                .map(|p| p.user_id)
                .collect();
            if members.contains(&a) && members.contains(&b) {
                return Ok(Some(conversation.id));
            }
        }
        Ok(None)
    }

    async fn group_name_taken(&self, creator_id: Uuid, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().conversations.values().any(|c| {
            c.kind == ConversationKind::Group
                && c.creator_id == Some(creator_id)
                && c.name.as_deref() == Some(name)
        }))
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        participant_ids: &[Uuid],
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        for user_id in participant_ids {
            inner.participants.push(ConversationParticipant {
                conversation_id: conversation.id,
                user_id: *user_id,
                last_read_at: None,
                bookmarked: false,
            });
        }
        Ok(())
    }

    async fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .inner
            .lock()
            .unwrap()
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .map(|p| p.user_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .participants
            .iter()
            .any(|p| p.conversation_id == conversation_id && p.user_id == user_id))
    }

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner
            .participants
            .iter()
            .any(|p| p.conversation_id == conversation_id && p.user_id == user_id);
        if !exists {
            inner.participants.push(ConversationParticipant {
                conversation_id,
                user_id,
                last_read_at: None,
                bookmarked: false,
            });
        }
        Ok(())
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .participants
            .retain(|p| !(p.conversation_id == conversation_id && p.user_id == user_id));
        Ok(())
    }

    async fn co_participant_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        let my_conversations: HashSet<Uuid> = inner
            .participants
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.conversation_id)
            .collect();
        let mut peers: Vec<Uuid> = inner
            .participants
            .iter()
            .filter(|p| my_conversations.contains(&p.conversation_id) && p.user_id != user_id)
            .map(|p| p.user_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        peers.sort();
        Ok(peers)
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationListRow>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        let mut rows = Vec::new();
        for participant in inner.participants.iter().filter(|p| p.user_id == user_id) {
            let conversation = inner.conversations[&participant.conversation_id].clone();
            let participant_ids: Vec<Uuid> = inner
                .participants
                .iter()
                .filter(|p| p.conversation_id == conversation.id)
                .map(|p| p.user_id)
                .collect();
            let unread_count = inner
                .messages
                .iter()
                .filter(|m| {
                    m.conversation_id == conversation.id
                        && m.sender_id != user_id
                        && m.read_at.is_none()
                })
                .count() as i64;
            let last_activity_at = inner
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation.id)
                .map(|m| m.created_at)
                .max();
            rows.push(ConversationListRow {
                conversation,
                participant_ids,
                unread_count,
                bookmarked: participant.bookmarked,
                last_activity_at,
            });
        }
        Ok(rows)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        self.inner.lock().unwrap().messages.push(message.clone());
        Ok(())
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(messages
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        for message in inner.messages.iter_mut() {
            if message.conversation_id == conversation_id
                && message.sender_id != user_id
                && message.read_at.is_none()
            {
                message.read_at = Some(now);
            }
        }
        for participant in inner.participants.iter_mut() {
            if participant.conversation_id == conversation_id && participant.user_id == user_id {
                participant.last_read_at = Some(now);
            }
        }
        Ok(now)
    }

    async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        kind: ReactionKind,
    ) -> Result<ReactionMap> {
        let mut inner = self.inner.lock().unwrap();
        let row = (message_id, user_id, kind);
        if !inner.reactions.remove(&row) {
            inner.reactions.insert(row);
        }
        Ok(MemoryStore::reaction_map(&inner, message_id))
    }
}

#[derive(Default)]
struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    online: Mutex<HashSet<Uuid>>,
}

#[async_trait]
impl CacheGateway for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    async fn add_online(&self, user_id: Uuid) {
        self.online.lock().unwrap().insert(user_id);
    }

    async fn remove_online(&self, user_id: Uuid) {
        self.online.lock().unwrap().remove(&user_id);
    }

    async fn is_online(&self, user_id: Uuid) -> bool {
        self.online.lock().unwrap().contains(&user_id)
    }
}

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<BrokerEvent>>,
    fail: Mutex<bool>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &BrokerEvent) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("broker down"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct StaticIdentity {
    known: Mutex<HashMap<Uuid, Profile>>,
    unreachable: Mutex<bool>,
    batch_requests: Mutex<Vec<Vec<Uuid>>>,
}

impl StaticIdentity {
    fn learn(&self, id: Uuid, name: &str) {
        self.known.lock().unwrap().insert(
            id,
            Profile {
                id,
                display_name: name.to_string(),
                avatar_url: None,
            },
        );
    }
}

#[async_trait]
impl IdentityClient for StaticIdentity {
    async fn profile(&self, id: Uuid) -> Result<Option<Profile>> {
        if *self.unreachable.lock().unwrap() {
            return Err(anyhow!("identity service unreachable"));
        }
        Ok(self.known.lock().unwrap().get(&id).cloned())
    }

    async fn profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>> {
        if *self.unreachable.lock().unwrap() {
            return Err(anyhow!("identity service unreachable"));
        }
        self.batch_requests.lock().unwrap().push(ids.to_vec());
        let known = self.known.lock().unwrap();
        Ok(ids.iter().filter_map(|id| known.get(id).cloned()).collect())
    }
}

/// Records every broadcast and, for NEW_MESSAGE, whether the message was
/// already durable in the store when the broadcast happened.
struct ObservingPush {
    store: Arc<MemoryStore>,
    sent: Mutex<Vec<(Vec<Uuid>, ServerEnvelope)>>,
    durable_at_broadcast: Mutex<Vec<bool>>,
}

impl ObservingPush {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            sent: Mutex::new(Vec::new()),
            durable_at_broadcast: Mutex::new(Vec::new()),
        }
    }

    fn broadcasts(&self) -> Vec<(Vec<Uuid>, ServerEnvelope)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimePush for ObservingPush {
    async fn send(&self, user_id: Uuid, envelope: ServerEnvelope) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((vec![user_id], envelope));
        true
    }

    async fn broadcast(&self, recipients: &[Uuid], envelope: ServerEnvelope) {
        if let ServerEnvelope::NewMessage { message } = &envelope {
            self.durable_at_broadcast
                .lock()
                .unwrap()
                .push(self.store.has_message(message.id));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), envelope));
    }
}

struct Harness {
    service: ChatService,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    publisher: Arc<RecordingPublisher>,
    identity: Arc<StaticIdentity>,
    push: Arc<ObservingPush>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::default());
    let cache = Arc::new(MemoryCache::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let identity = Arc::new(StaticIdentity::default());
    let push = Arc::new(ObservingPush::new(store.clone()));
    let service = ChatService::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        identity.clone(),
        push.clone(),
        Duration::from_secs(60),
    );
    Harness {
        service,
        store,
        cache,
        publisher,
        identity,
        push,
    }
}

fn known_user(h: &Harness, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    h.store.add_user(id, name);
    id
}

// -- Direct conversations --

#[tokio::test]
async fn create_or_get_direct_is_idempotent_in_either_order() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");

    let first = h.service.create_or_get_direct(alice, bob).await.unwrap();
    let second = h.service.create_or_get_direct(alice, bob).await.unwrap();
    let flipped = h.service.create_or_get_direct(bob, alice).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.id, flipped.id);
}

#[tokio::test]
async fn direct_with_self_is_bad_request() {
    let h = harness();
    let alice = known_user(&h, "alice");
    assert!(matches!(
        h.service.create_or_get_direct(alice, alice).await,
        Err(ChatError::BadRequest(_))
    ));
}

#[tokio::test]
async fn direct_resolves_unknown_users_through_identity() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let stranger = Uuid::new_v4();

    // Not in the store, not known upstream: blocked.
    assert!(matches!(
        h.service.create_or_get_direct(alice, stranger).await,
        Err(ChatError::BadRequest(_))
    ));

    // Known upstream: replicated locally, then created.
    h.identity.learn(stranger, "casey");
    h.service.create_or_get_direct(alice, stranger).await.unwrap();
    assert!(h.store.user(stranger).await.unwrap().is_some());
}

#[tokio::test]
async fn identity_outage_surfaces_as_upstream() {
    let h = harness();
    let alice = known_user(&h, "alice");
    *h.identity.unreachable.lock().unwrap() = true;
    assert!(matches!(
        h.service.create_or_get_direct(alice, Uuid::new_v4()).await,
        Err(ChatError::Upstream(_))
    ));
}

// -- Groups --

#[tokio::test]
async fn group_needs_two_distinct_members_after_dedupe() {
    let h = harness();
    let creator = known_user(&h, "creator");

    // Only the creator (duplicated) in the member list.
    let req = CreateGroupRequest {
        name: "rust study".into(),
        description: None,
        category: None,
        member_ids: vec![creator, creator],
        is_private: false,
        tags: vec![],
    };
    assert!(matches!(
        h.service.create_group(creator, req).await,
        Err(ChatError::BadRequest(_))
    ));
}

#[tokio::test]
async fn duplicate_group_name_for_same_creator_conflicts() {
    let h = harness();
    let creator = known_user(&h, "creator");
    let member = known_user(&h, "member");

    let req = || CreateGroupRequest {
        name: "rust study".into(),
        description: None,
        category: None,
        member_ids: vec![member],
        is_private: false,
        tags: vec![],
    };
    h.service.create_group(creator, req()).await.unwrap();
    assert!(matches!(
        h.service.create_group(creator, req()).await,
        Err(ChatError::Conflict(_))
    ));

    // A different creator may reuse the name.
    let other = known_user(&h, "other");
    h.service.create_group(other, req()).await.unwrap();
}

#[tokio::test]
async fn group_members_unknown_locally_resolve_in_one_identity_batch() {
    let h = harness();
    let creator = known_user(&h, "creator");
    let remote_a = Uuid::new_v4();
    let remote_b = Uuid::new_v4();
    h.identity.learn(remote_a, "remote-a");
    h.identity.learn(remote_b, "remote-b");

    h.service
        .create_group(
            creator,
            CreateGroupRequest {
                name: "seminar".into(),
                description: None,
                category: None,
                member_ids: vec![remote_a, remote_b],
                is_private: false,
                tags: vec![],
            },
        )
        .await
        .unwrap();

    // Both unknown members went out in a single batch lookup and got
    // replicated locally.
    let batches = h.identity.batch_requests.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert!(h.store.user(remote_a).await.unwrap().is_some());
    assert!(h.store.user(remote_b).await.unwrap().is_some());
}

#[tokio::test]
async fn group_with_unresolvable_member_is_rejected_before_any_write() {
    let h = harness();
    let creator = known_user(&h, "creator");
    let known_remote = Uuid::new_v4();
    h.identity.learn(known_remote, "remote");
    let stranger = Uuid::new_v4();

    let result = h
        .service
        .create_group(
            creator,
            CreateGroupRequest {
                name: "seminar".into(),
                description: None,
                category: None,
                member_ids: vec![known_remote, stranger],
                is_private: false,
                tags: vec![],
            },
        )
        .await;

    assert!(matches!(result, Err(ChatError::BadRequest(_))));
    // The resolvable member was not replicated either.
    assert!(h.store.user(known_remote).await.unwrap().is_none());
}

#[tokio::test]
async fn group_membership_is_creator_gated() {
    let h = harness();
    let u1 = known_user(&h, "u1");
    let u2 = known_user(&h, "u2");
    let u3 = known_user(&h, "u3");

    let group = h
        .service
        .create_group(
            u1,
            CreateGroupRequest {
                name: "seminar".into(),
                description: None,
                category: None,
                member_ids: vec![u2, u3],
                is_private: false,
                tags: vec![],
            },
        )
        .await
        .unwrap();

    // Non-creator cannot remove.
    assert!(matches!(
        h.service.remove_participant(group.id, u2, u3).await,
        Err(ChatError::Forbidden)
    ));
    // Creator cannot remove themself through this path.
    assert!(matches!(
        h.service.remove_participant(group.id, u1, u1).await,
        Err(ChatError::BadRequest(_))
    ));
    // Creator removes a member; the member loses authorization.
    h.service.remove_participant(group.id, u1, u3).await.unwrap();
    assert!(matches!(
        h.service.list_messages(group.id, u3, 1, 50).await,
        Err(ChatError::Forbidden)
    ));
}

#[tokio::test]
async fn add_participant_requires_group_and_creator() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let newcomer = known_user(&h, "newcomer");

    let direct = h.service.create_or_get_direct(alice, bob).await.unwrap();
    assert!(matches!(
        h.service.add_participant(direct.id, alice, newcomer).await,
        Err(ChatError::BadRequest(_))
    ));

    let group = h
        .service
        .create_group(
            alice,
            CreateGroupRequest {
                name: "club".into(),
                description: None,
                category: None,
                member_ids: vec![bob],
                is_private: false,
                tags: vec![],
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        h.service.add_participant(group.id, bob, newcomer).await,
        Err(ChatError::Forbidden)
    ));
    h.service
        .add_participant(group.id, alice, newcomer)
        .await
        .unwrap();
    assert!(h.store.is_participant(group.id, newcomer).await.unwrap());
}

// -- Messages --

#[tokio::test]
async fn send_message_persists_before_any_broadcast() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    h.service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    let durability = h.push.durable_at_broadcast.lock().unwrap().clone();
    assert_eq!(durability, vec![true]);
}

#[tokio::test]
async fn send_message_reaches_peer_and_broker_with_sole_recipient() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    let message = h
        .service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    let broadcasts = h.push.broadcasts();
    let (recipients, envelope) = broadcasts
        .iter()
        .find(|(_, e)| matches!(e, ServerEnvelope::NewMessage { .. }))
        .unwrap();
    assert_eq!(recipients.as_slice(), &[bob]);
    match envelope {
        ServerEnvelope::NewMessage { message: m } => {
            assert_eq!(m.content, "hi");
            assert_eq!(m.sender_id, alice);
        }
        _ => unreachable!(),
    }

    let events = h.publisher.events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        BrokerEvent::MessageSent { message_id, recipient_ids, .. }
            if *message_id == message.id && recipient_ids.as_slice() == [bob]
    )));
}

#[tokio::test]
async fn send_message_fails_closed_for_outsiders_and_bad_content() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let outsider = known_user(&h, "outsider");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    assert!(matches!(
        h.service
            .send_message(outsider, conversation.id, "hi".into(), None)
            .await,
        Err(ChatError::Forbidden)
    ));
    assert!(matches!(
        h.service
            .send_message(alice, conversation.id, "   ".into(), None)
            .await,
        Err(ChatError::BadRequest(_))
    ));
    let oversize = "x".repeat(2001);
    assert!(matches!(
        h.service
            .send_message(alice, conversation.id, oversize, None)
            .await,
        Err(ChatError::BadRequest(_))
    ));
    assert_eq!(h.store.message_count(), 0);
}

#[tokio::test]
async fn broker_outage_never_fails_send() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    *h.publisher.fail.lock().unwrap() = true;
    h.service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();
    assert_eq!(h.store.message_count(), 1);
}

#[tokio::test]
async fn list_messages_pages_newest_first() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    for i in 0..5 {
        h.service
            .send_message(alice, conversation.id, format!("m{i}"), None)
            .await
            .unwrap();
    }

    let page1 = h
        .service
        .list_messages(conversation.id, bob, 1, 2)
        .await
        .unwrap();
    let page2 = h
        .service
        .list_messages(conversation.id, bob, 2, 2)
        .await
        .unwrap();
    assert_eq!(page1.len(), 2);
    assert_eq!(page1[0].content, "m4");
    assert_eq!(page2[0].content, "m2");
}

#[tokio::test]
async fn absurd_page_numbers_yield_an_empty_page() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();
    h.service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    // page and limit arrive unvalidated from the query string.
    let page = h
        .service
        .list_messages(conversation.id, bob, u32::MAX, u32::MAX)
        .await
        .unwrap();
    assert!(page.is_empty());
}

#[tokio::test]
async fn mark_read_notifies_everyone_but_the_reader() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();
    h.service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    h.service.mark_read(conversation.id, bob).await.unwrap();

    let broadcasts = h.push.broadcasts();
    let (recipients, envelope) = broadcasts
        .iter()
        .find(|(_, e)| matches!(e, ServerEnvelope::MessagesRead { .. }))
        .unwrap();
    assert_eq!(recipients.as_slice(), &[alice]);
    assert!(matches!(
        envelope,
        ServerEnvelope::MessagesRead { reader_id, .. } if *reader_id == bob
    ));

    // The store no longer reports the message unread.
    let rows = h.store.list_conversations(bob).await.unwrap();
    assert_eq!(rows[0].unread_count, 0);
}

#[tokio::test]
async fn mark_read_is_forbidden_for_outsiders() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let outsider = known_user(&h, "outsider");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    assert!(matches!(
        h.service.mark_read(conversation.id, outsider).await,
        Err(ChatError::Forbidden)
    ));
}

// -- Reactions --

#[tokio::test]
async fn reaction_toggle_parity() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();
    let message = h
        .service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    // Odd number of toggles flips membership exactly once.
    h.service
        .toggle_reaction(message.id, bob, ReactionKind::Heart)
        .await
        .unwrap();
    assert_eq!(h.store.reaction_count(), 1);

    // Even number of toggles restores the original state.
    h.service
        .toggle_reaction(message.id, bob, ReactionKind::Heart)
        .await
        .unwrap();
    assert_eq!(h.store.reaction_count(), 0);

    // Different kinds from the same user coexist.
    h.service
        .toggle_reaction(message.id, bob, ReactionKind::Star)
        .await
        .unwrap();
    h.service
        .toggle_reaction(message.id, bob, ReactionKind::Sparkles)
        .await
        .unwrap();
    assert_eq!(h.store.reaction_count(), 2);
}

#[tokio::test]
async fn reaction_update_is_broadcast_to_all_participants_including_actor() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();
    let message = h
        .service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    h.service
        .toggle_reaction(message.id, bob, ReactionKind::Like)
        .await
        .unwrap();

    let broadcasts = h.push.broadcasts();
    let (recipients, envelope) = broadcasts
        .iter()
        .find(|(_, e)| matches!(e, ServerEnvelope::ReactionUpdate { .. }))
        .unwrap();
    let mut expected = vec![alice, bob];
    expected.sort();
    assert_eq!(recipients.as_slice(), expected.as_slice());
    match envelope {
        ServerEnvelope::ReactionUpdate { reactions, .. } => {
            assert_eq!(reactions[&ReactionKind::Like], vec![bob]);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn reaction_errors_follow_the_taxonomy() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let outsider = known_user(&h, "outsider");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();
    let message = h
        .service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    assert!(matches!(
        h.service
            .toggle_reaction(Uuid::new_v4(), bob, ReactionKind::Like)
            .await,
        Err(ChatError::NotFound)
    ));
    assert!(matches!(
        h.service
            .toggle_reaction(message.id, outsider, ReactionKind::Like)
            .await,
        Err(ChatError::Forbidden)
    ));
}

// -- Conversation listing / cache --

#[tokio::test]
async fn list_conversations_is_cache_aside() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    h.service.create_or_get_direct(alice, bob).await.unwrap();

    let first = h.service.list_conversations(alice).await.unwrap();
    let second = h.service.list_conversations(alice).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    // Second read served from cache.
    assert_eq!(h.store.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn new_message_invalidates_cached_lists() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    h.service.list_conversations(bob).await.unwrap();
    h.service
        .send_message(alice, conversation.id, "hi".into(), None)
        .await
        .unwrap();

    let refreshed = h.service.list_conversations(bob).await.unwrap();
    assert_eq!(refreshed[0].unread_count, 1);
    assert_eq!(h.store.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn direct_summary_carries_peer_presence_and_name() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    h.service.create_or_get_direct(alice, bob).await.unwrap();
    h.cache.add_online(bob).await;

    let list = h.service.list_conversations(alice).await.unwrap();
    assert_eq!(list[0].name.as_deref(), Some("bob"));
    assert_eq!(list[0].peer_online, Some(true));
}

#[tokio::test]
async fn list_messages_forbidden_for_non_participants() {
    let h = harness();
    let alice = known_user(&h, "alice");
    let bob = known_user(&h, "bob");
    let outsider = known_user(&h, "outsider");
    let conversation = h.service.create_or_get_direct(alice, bob).await.unwrap();

    assert!(matches!(
        h.service.list_messages(conversation.id, outsider, 1, 50).await,
        Err(ChatError::Forbidden)
    ));
}
