use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use circle_common::SnowflakeGenerator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::db::kv::{KeyValueStore, MemoryStore, RedisStore};
use relay_api::db::PgStore;
use relay_api::gateway::liveness;
use relay_api::notifications::push;
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Connect to PostgreSQL.
    let db = relay_api::db::pool::connect(&config.database_url).await;
    let store = Arc::new(PgStore::new(db));

    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .expect("failed to connect to Redis"),
        ),
        None => {
            tracing::warn!("REDIS_URL not set, tokens live in process memory");
            Arc::new(MemoryStore::new())
        }
    };

    let push = push::from_config(&config.push).expect("invalid VAPID configuration");
    let snowflake = Arc::new(SnowflakeGenerator::new(config.worker_id));

    tracing::info!(
        heartbeat_ms = config.presence.heartbeat_interval.as_millis() as u64,
        away_after_secs = config.presence.away_after.as_secs(),
        push_enabled = config.push.is_enabled(),
        "relay-api configured"
    );

    let sweep_every = config.presence.sweep_interval;
    let state = AppState::new(config, store, kv, push, snowflake);

    liveness::spawn(state.relay.presence().clone(), sweep_every);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
