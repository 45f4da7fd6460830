use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, ReactionKind, ReactionMap};

/// Envelopes sent FROM client TO server over the WebSocket.
/// Anything that fails to decode into this closed set is logged and dropped;
/// a malformed frame never terminates the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientEnvelope {
    DirectMessage {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        replying_to_message_id: Option<Uuid>,
    },
    TypingStart {
        conversation_id: Uuid,
    },
    TypingStop {
        conversation_id: Uuid,
    },
    MarkRead {
        conversation_id: Uuid,
    },
    ReactToMessage {
        message_id: Uuid,
        kind: ReactionKind,
    },
}

/// Envelopes sent FROM server TO client, mirroring the domain events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerEnvelope {
    NewMessage {
        message: Message,
    },
    TypingUpdate {
        conversation_id: Uuid,
        user_id: Uuid,
        typing: bool,
    },
    MessagesRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        read_at: DateTime<Utc>,
    },
    ReactionUpdate {
        conversation_id: Uuid,
        message_id: Uuid,
        reactions: ReactionMap,
    },
    PresenceUpdate {
        user_id: Uuid,
        online: bool,
    },
}

/// Presence change published on the shared channel; every instance
/// (including the publisher) subscribes to the same channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum PresenceEvent {
    Online { user_id: Uuid },
    Offline { user_id: Uuid },
}

impl PresenceEvent {
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Online { user_id } | Self::Offline { user_id } => *user_id,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online { .. })
    }
}

/// Fire-and-forget events for downstream notification consumers.
/// Versionless JSON, keyed by conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum BrokerEvent {
    #[serde(rename = "message.sent")]
    MessageSent {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_ids: Vec<Uuid>,
    },
    #[serde(rename = "messages.read")]
    MessagesRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        recipient_ids: Vec<Uuid>,
    },
    #[serde(rename = "group.updated")]
    GroupUpdated {
        conversation_id: Uuid,
        actor_id: Uuid,
        change: GroupChange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupChange {
    Created,
    MemberAdded,
    MemberRemoved,
}

impl BrokerEvent {
    /// Partition key: all events for one conversation stay ordered.
    pub fn key(&self) -> Uuid {
        match self {
            Self::MessageSent { conversation_id, .. }
            | Self::MessagesRead { conversation_id, .. }
            | Self::GroupUpdated { conversation_id, .. } => *conversation_id,
        }
    }
}
