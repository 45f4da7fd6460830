//! Redis-backed cache and online set. Every failure is logged and answered
//! with the miss default, so a Redis outage degrades reads to the store
//! instead of failing them.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use agora_chat::ports::CacheGateway;

const ONLINE_SET_KEY: &str = "presence:online";

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connects eagerly; the manager reconnects on its own afterwards.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheGateway for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "cache get failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(err) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(key, error = %err, "cache set failed");
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.del::<_, ()>(key).await {
            warn!(key, error = %err, "cache delete failed");
        }
    }

    async fn add_online(&self, user_id: Uuid) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn
            .sadd::<_, _, ()>(ONLINE_SET_KEY, user_id.to_string())
            .await
        {
            warn!(%user_id, error = %err, "failed to add user to online set");
        }
    }

    async fn remove_online(&self, user_id: Uuid) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn
            .srem::<_, _, ()>(ONLINE_SET_KEY, user_id.to_string())
            .await
        {
            warn!(%user_id, error = %err, "failed to remove user from online set");
        }
    }

    async fn is_online(&self, user_id: Uuid) -> bool {
        let mut conn = self.conn.clone();
        match conn
            .sismember::<_, _, bool>(ONLINE_SET_KEY, user_id.to_string())
            .await
        {
            Ok(member) => member,
            Err(err) => {
                warn!(%user_id, error = %err, "online check failed, reporting offline");
                false
            }
        }
    }
}
