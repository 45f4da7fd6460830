//! Postgres persistence. The store is the single source of truth shared by
//! all instances; everything requiring atomicity happens here in
//! transactions.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use agora_chat::ports::{ChatStore, ConversationListRow};
use agora_gateway::PresenceDirectory;
use agora_types::models::{
    Conversation, ConversationKind, Message, ReactionKind, ReactionMap, User,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    display_name TEXT NOT NULL,
    avatar_url TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT,
    description TEXT,
    category TEXT,
    creator_id UUID REFERENCES users(id) ON DELETE SET NULL,
    is_live BOOLEAN NOT NULL DEFAULT FALSE,
    is_private BOOLEAN NOT NULL DEFAULT FALSE,
    is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
    tags TEXT[] NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS conversations_group_name_per_creator
    ON conversations (creator_id, name) WHERE kind = 'group';

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    last_read_at TIMESTAMPTZ,
    bookmarked BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (conversation_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_id UUID NOT NULL REFERENCES users(id),
    content TEXT NOT NULL,
    replying_to_message_id UUID REFERENCES messages(id),
    read_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS messages_conversation_recency
    ON messages (conversation_id, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS reactions (
    message_id UUID NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (message_id, user_id, kind)
);
"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Statements are idempotent, safe to run on every
    /// boot from any instance.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    /// Reaction rows for a batch of messages, grouped per message.
    async fn reactions_for(&self, message_ids: &[Uuid]) -> Result<HashMap<Uuid, ReactionMap>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT message_id, user_id, kind
            FROM reactions
            WHERE message_id = ANY($1)
            ORDER BY kind, user_id
            "#,
        )
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to load reactions")?;

        let mut grouped: HashMap<Uuid, ReactionMap> = HashMap::new();
        for row in rows {
            let message_id: Uuid = row.get("message_id");
            let user_id: Uuid = row.get("user_id");
            let raw_kind: String = row.get("kind");
            let Some(kind) = ReactionKind::from_str(&raw_kind) else {
                warn!(%message_id, kind = %raw_kind, "skipping reaction with unknown kind");
                continue;
            };
            grouped
                .entry(message_id)
                .or_default()
                .entry(kind)
                .or_default()
                .push(user_id);
        }
        Ok(grouped)
    }
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation> {
    let raw_kind: String = row.try_get("kind")?;
    let Some(kind) = ConversationKind::from_str(&raw_kind) else {
        bail!("unknown conversation kind {raw_kind:?}");
    };
    Ok(Conversation {
        id: row.try_get("id")?,
        kind,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        creator_id: row.try_get("creator_id")?,
        is_live: row.try_get("is_live")?,
        is_private: row.try_get("is_private")?,
        is_resolved: row.try_get("is_resolved")?,
        tags: row.try_get("tags")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        replying_to_message_id: row.try_get("replying_to_message_id")?,
        reactions: ReactionMap::new(),
        read_at: row.try_get("read_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ChatStore for PostgresStore {
    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, display_name, avatar_url FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load user")?;
        Ok(row.map(|row| User {
            id: row.get("id"),
            display_name: row.get("display_name"),
            avatar_url: row.get("avatar_url"),
        }))
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, avatar_url)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                avatar_url = EXCLUDED.avatar_url
            "#,
        )
        .bind(user.id)
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .execute(&self.pool)
        .await
        .context("failed to upsert user")?;
        Ok(())
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load conversation")?;
        row.map(|row| conversation_from_row(&row)).transpose()
    }

    async fn find_direct_between(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            SELECT c.id
            FROM conversations c
            JOIN conversation_participants pa
              ON pa.conversation_id = c.id AND pa.user_id = $1
            JOIN conversation_participants pb
              ON pb.conversation_id = c.id AND pb.user_id = $2
            WHERE c.kind = 'direct'
            LIMIT 1
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up direct conversation")?;
        Ok(row.map(|row| row.get("id")))
    }

    async fn group_name_taken(&self, creator_id: Uuid, name: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM conversations
                WHERE kind = 'group' AND creator_id = $1 AND name = $2
            ) AS taken
            "#,
        )
        .bind(creator_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("failed to check group name")?;
        Ok(row.get("taken"))
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        participant_ids: &[Uuid],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, kind, name, description, category, creator_id,
                 is_live, is_private, is_resolved, tags, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(conversation.id)
        .bind(conversation.kind.as_str())
        .bind(&conversation.name)
        .bind(&conversation.description)
        .bind(&conversation.category)
        .bind(conversation.creator_id)
        .bind(conversation.is_live)
        .bind(conversation.is_private)
        .bind(conversation.is_resolved)
        .bind(&conversation.tags)
        .bind(conversation.created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert conversation")?;

        for user_id in participant_ids {
            sqlx::query(
                r#"
                INSERT INTO conversation_participants (conversation_id, user_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(conversation.id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("failed to insert participant")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id FROM conversation_participants
            WHERE conversation_id = $1
            ORDER BY user_id
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load participants")?;
        Ok(rows.into_iter().map(|row| row.get("user_id")).collect())
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM conversation_participants
                WHERE conversation_id = $1 AND user_id = $2
            ) AS member
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to check membership")?;
        Ok(row.get("member"))
    }

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to add participant")?;
        Ok(())
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "DELETE FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to remove participant")?;
        Ok(())
    }

    async fn co_participant_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT peer.user_id
            FROM conversation_participants own
            JOIN conversation_participants peer
              ON peer.conversation_id = own.conversation_id
            WHERE own.user_id = $1 AND peer.user_id <> $1
            ORDER BY peer.user_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load co-participants")?;
        Ok(rows.into_iter().map(|row| row.get("user_id")).collect())
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationListRow>> {
        let rows = sqlx::query(
            r#"
            SELECT c.*,
                   p.bookmarked,
                   (SELECT count(*) FROM messages m
                    WHERE m.conversation_id = c.id
                      AND m.sender_id <> $1
                      AND m.read_at IS NULL) AS unread_count,
                   (SELECT max(m.created_at) FROM messages m
                    WHERE m.conversation_id = c.id) AS last_activity_at,
                   ARRAY(SELECT cp.user_id FROM conversation_participants cp
                         WHERE cp.conversation_id = c.id
                         ORDER BY cp.user_id) AS participant_ids
            FROM conversations c
            JOIN conversation_participants p
              ON p.conversation_id = c.id AND p.user_id = $1
            ORDER BY last_activity_at DESC NULLS LAST, c.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list conversations")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConversationListRow {
                conversation: conversation_from_row(&row)?,
                participant_ids: row.try_get("participant_ids")?,
                unread_count: row.try_get("unread_count")?,
                bookmarked: row.try_get("bookmarked")?,
                last_activity_at: row.try_get("last_activity_at")?,
            });
        }
        Ok(out)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, content,
                 replying_to_message_id, read_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.replying_to_message_id)
        .bind(message.read_at)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;
        Ok(())
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load message")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row)?;
        let mut reactions = self.reactions_for(&[message.id]).await?;
        if let Some(map) = reactions.remove(&message.id) {
            message.reactions = map;
        }
        Ok(Some(message))
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to list messages")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(message_from_row(&row)?);
        }

        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        let mut reactions = self.reactions_for(&ids).await?;
        for message in &mut messages {
            if let Some(map) = reactions.remove(&message.id) {
                message.reactions = map;
            }
        }
        Ok(messages)
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<DateTime<Utc>> {
        let read_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE messages SET read_at = $3
            WHERE conversation_id = $1 AND sender_id <> $2 AND read_at IS NULL
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(read_at)
        .execute(&mut *tx)
        .await
        .context("failed to mark messages read")?;

        sqlx::query(
            r#"
            UPDATE conversation_participants SET last_read_at = $3
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(read_at)
        .execute(&mut *tx)
        .await
        .context("failed to bump last_read_at")?;

        tx.commit().await?;
        Ok(read_at)
    }

    async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        kind: ReactionKind,
    ) -> Result<ReactionMap> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM reactions WHERE message_id = $1 AND user_id = $2 AND kind = $3",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to delete reaction")?
        .rows_affected();

        if deleted == 0 {
            sqlx::query(
                r#"
                INSERT INTO reactions (message_id, user_id, kind)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(message_id)
            .bind(user_id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to insert reaction")?;
        }
        tx.commit().await?;

        let mut reactions = self.reactions_for(&[message_id]).await?;
        Ok(reactions.remove(&message_id).unwrap_or_default())
    }
}

#[async_trait]
impl PresenceDirectory for PostgresStore {
    async fn co_participants(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.co_participant_ids(user_id).await
    }
}
