mod config;
mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use agora_chat::ChatService;
use agora_gateway::{ConnectionRegistry, PresencePropagator};
use agora_infra::{
    HttpIdentityClient, KafkaPublisher, PostgresStore, RedisCache, RedisPresenceBus,
    run_presence_subscriber,
};

use crate::config::Config;
use crate::http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Storage
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PostgresStore::new(pool));
    store.migrate().await?;

    // Adapters
    let cache = Arc::new(RedisCache::connect(&config.redis_url).await?);
    let presence_bus = Arc::new(RedisPresenceBus::connect(&config.redis_url).await?);
    let events = Arc::new(KafkaPublisher::new(
        &config.kafka_brokers,
        config.kafka_topic.clone(),
    )?);
    let identity = Arc::new(HttpIdentityClient::new(config.identity_base_url.clone()));

    // Gateway + domain wiring
    let registry = ConnectionRegistry::new();
    let chat = Arc::new(ChatService::new(
        store.clone(),
        cache.clone(),
        events,
        identity,
        Arc::new(registry.clone()),
        config.cache_ttl,
    ));
    let presence = Arc::new(PresencePropagator::new(
        cache,
        presence_bus,
        Arc::new(registry.clone()),
        store,
    ));

    // Every instance consumes the presence channel, its own events included.
    tokio::spawn(run_presence_subscriber(
        config.redis_url.clone(),
        presence.clone(),
    ));

    let state = AppState {
        chat,
        registry,
        presence,
        session_secret: config.session_secret.clone(),
        jwt_secret: config.jwt_secret.clone(),
    };

    let protected_routes = Router::new()
        .route("/conversations", get(http::list_conversations))
        .route("/conversations/direct", post(http::create_direct))
        .route("/conversations/group", post(http::create_group))
        .route(
            "/conversations/{conversation_id}/messages",
            get(http::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/participants",
            post(http::add_participant),
        )
        .route(
            "/conversations/{conversation_id}/participants/{user_id}",
            delete(http::remove_participant),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http::require_auth,
        ));

    let app = Router::new()
        .merge(protected_routes)
        .route("/gateway", get(http::gateway_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("agora server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
