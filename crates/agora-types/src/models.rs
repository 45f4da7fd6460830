use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimal user record replicated lazily from the identity service.
/// Never deleted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    /// Nullable: the creator's account may be removed upstream.
    pub creator_id: Option<Uuid>,
    pub is_live: bool,
    pub is_private: bool,
    pub is_resolved: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Row existence is the authorization gate for every operation on a
/// conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationParticipant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_read_at: Option<DateTime<Utc>>,
    pub bookmarked: bool,
}

/// Closed set of reaction kinds. At most one row per (message, user, kind)
/// exists in the store, which is what makes the toggle idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Upvote,
    Downvote,
    Star,
    Heart,
    Sparkles,
}

impl ReactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Upvote => "upvote",
            Self::Downvote => "downvote",
            Self::Star => "star",
            Self::Heart => "heart",
            Self::Sparkles => "sparkles",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "like" => Some(Self::Like),
            "upvote" => Some(Self::Upvote),
            "downvote" => Some(Self::Downvote),
            "star" => Some(Self::Star),
            "heart" => Some(Self::Heart),
            "sparkles" => Some(Self::Sparkles),
            _ => None,
        }
    }
}

/// Reaction kind -> user ids currently holding that reaction.
/// BTreeMap so the wire representation is stable.
pub type ReactionMap = BTreeMap<ReactionKind, Vec<Uuid>>;

/// Append-only apart from `reactions` and `read_at`.
/// Ordering key is `created_at`, ties broken by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    /// Self-reference into the same flat message sequence.
    pub replying_to_message_id: Option<Uuid>,
    #[serde(default)]
    pub reactions: ReactionMap,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
