//! Chatwire API server
//!
//! Wires storage, presence, locks, and the WebSocket hub into the engine
//! and serves the HTTP/WS surface.

use std::sync::Arc;

use anyhow::Context;
use chatwire_api::{AppState, Config};
use chatwire_engine::{
    lock::RedisLock, presence::RedisPresence, store::PgStore, AssignPolicy, Engine,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use chatwire_api::auth::JwtVerifier;
use chatwire_api::routes::create_router;
use chatwire_api::websocket::{sink::HubSink, SessionHub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);

    let pool = chatwire_shared::db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    chatwire_shared::db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("database pool ready");

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;
    tracing::info!("redis connection ready");

    let hub = SessionHub::new();
    let assign_policy = if config.assign_override_admin_only {
        AssignPolicy::AdminOnly
    } else {
        AssignPolicy::AnyStaff
    };
    let engine = Engine::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(RedisPresence::new(redis_conn.clone(), config.presence_ttl)),
        Arc::new(RedisLock::new(redis_conn)),
    )
    .with_sink(Arc::new(HubSink::new(hub.clone())))
    .with_engagement(Arc::new(hub.clone()))
    .with_assign_policy(assign_policy);

    let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));

    let state = AppState {
        pool,
        config: Arc::clone(&config),
        engine,
        hub,
        verifier,
    };

    // Widgets are embedded on customer sites, so REST calls arrive
    // cross-origin. Per-site origin policy is enforced at the WS layer.
    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "chatwire-api listening");
    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
