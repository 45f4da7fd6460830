use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ConversationKind;

// -- JWT Claims --

/// Claims shared by the REST middleware and the WebSocket handshake.
/// Canonical definition lives here in agora-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Identity service --

/// Public profile as returned by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CreateDirectRequest {
    pub recipient_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub member_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MessagePageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

/// One row of the cached conversation list. Serialized as-is into the cache,
/// so the whole list is invalidated rather than patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub kind: ConversationKind,
    /// Group name, or the direct peer's display name.
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub creator_id: Option<Uuid>,
    pub is_live: bool,
    pub is_private: bool,
    pub is_resolved: bool,
    pub tags: Vec<String>,
    pub participant_ids: Vec<Uuid>,
    pub unread_count: i64,
    pub bookmarked: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// For direct conversations: whether the peer is in the shared online-set.
    pub peer_online: Option<bool>,
}

// -- Errors --

/// Field-level validation error list for HTTP 4xx payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}
