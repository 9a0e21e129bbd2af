use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio::time::{self, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use messenger_api::config::Config;
use messenger_api::db::kv::{KeyValueStore, MemoryStore, RedisStore};
use messenger_api::push::{NoopNotifier, PushNotifier, WebhookNotifier};
use messenger_api::repo::{ChatRepository, MemoryRepository, PgRepository};
use messenger_api::AppState;

const DB_POOL_SIZE: usize = 16;

#[tokio::main]
async fn main() {
    // A missing .env is fine; the environment may already be set.
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
    let sweep_interval = config.call_sweep_interval;

    let repo: Arc<dyn ChatRepository> = match &config.database_url {
        Some(url) => {
            let pool = messenger_api::db::pool::connect(url, DB_POOL_SIZE).expect("failed to create database pool");
            Arc::new(PgRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory repository");
            Arc::new(MemoryRepository::new())
        }
    };

    let push: Arc<dyn PushNotifier> = match &config.push_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };

    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await.expect("failed to connect to redis")),
        None => {
            tracing::warn!("REDIS_URL not set, sessions are kept in process memory");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(config, repo, push, kv);

    let call_hub = state.call_hub.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let report = call_hub.sweep(Instant::now());
            if report.timed_out > 0 || report.evicted > 0 {
                tracing::debug!(timed_out = report.timed_out, evicted = report.evicted, "call table swept");
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(messenger_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "messenger-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .expect("server error");
}

/// Wait for Ctrl-C, then drain both hubs so every socket gets a close frame.
async fn shutdown_signal(state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
    tokio::join!(state.chat_hub.shutdown(), state.call_hub.shutdown());
}
