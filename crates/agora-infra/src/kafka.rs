//! Kafka event publishing for downstream notification consumers. Keyed by
//! conversation id so all events for one conversation stay in order within a
//! partition.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::debug;

use agora_chat::ports::EventPublisher;
use agora_types::events::BrokerEvent;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, topic: String) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create kafka producer")?;
        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &BrokerEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("failed to encode broker event")?;
        let key = event.key().to_string();
        let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);

        let delivery = self
            .producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(err, _)| anyhow!("kafka send failed: {err}"))?;
        debug!(
            topic = %self.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "broker event published"
        );
        Ok(())
    }
}
