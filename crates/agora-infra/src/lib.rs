//! Adapters behind the domain ports: Postgres persistence, Redis cache and
//! presence channel, Kafka event publishing and the HTTP identity client.

pub mod identity;
pub mod kafka;
pub mod postgres;
pub mod presence_bus;
pub mod redis_cache;

pub use identity::HttpIdentityClient;
pub use kafka::KafkaPublisher;
pub use postgres::PostgresStore;
pub use presence_bus::{PRESENCE_CHANNEL, RedisPresenceBus, run_presence_subscriber};
pub use redis_cache::RedisCache;
