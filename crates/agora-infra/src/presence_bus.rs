//! Redis pub/sub presence channel. Every instance publishes its own
//! connect/disconnect events and subscribes to the channel — including to
//! its own messages, which keeps the fan-out path identical whether the
//! event was local or remote.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use agora_gateway::{PresencePropagator, PresencePublisher};
use agora_types::events::PresenceEvent;

pub const PRESENCE_CHANNEL: &str = "presence.events";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

pub struct RedisPresenceBus {
    conn: ConnectionManager,
}

impl RedisPresenceBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl PresencePublisher for RedisPresenceBus {
    async fn publish(&self, event: &PresenceEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("failed to encode presence event")?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(PRESENCE_CHANNEL, payload)
            .await
            .context("failed to publish presence event")?;
        Ok(())
    }
}

/// Consume the presence channel forever, reconnecting on failure. Spawned
/// once per instance at startup.
pub async fn run_presence_subscriber(redis_url: String, propagator: Arc<PresencePropagator>) {
    loop {
        if let Err(err) = subscribe_once(&redis_url, &propagator).await {
            warn!(error = %err, "presence subscription lost, reconnecting");
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn subscribe_once(redis_url: &str, propagator: &PresencePropagator) -> Result<()> {
    let client = redis::Client::open(redis_url).context("invalid redis url")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("failed to open pubsub connection")?;
    pubsub
        .subscribe(PRESENCE_CHANNEL)
        .await
        .context("failed to subscribe to presence channel")?;
    info!(channel = PRESENCE_CHANNEL, "presence subscriber running");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "unreadable presence payload, skipping");
                continue;
            }
        };
        match serde_json::from_str::<PresenceEvent>(&payload) {
            Ok(event) => {
                if let Err(err) = propagator.handle_event(event).await {
                    warn!(error = %err, "presence fan-out failed");
                }
            }
            Err(err) => {
                warn!(error = %err, raw = %payload, "malformed presence event, skipping");
            }
        }
    }
    Ok(())
}
