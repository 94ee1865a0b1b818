//! Topup Fulfillment Service - Main Application Entry Point
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Connect to Redis (task queue and leases)
//! 5. Start the realtime notifier and the topup dispatcher
//! 6. Build HTTP router with routes and middleware
//! 7. Start server on configured port

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use topup_fulfillment::{
    config, db, handlers,
    jobs::{
        dispatcher::{Dispatcher, VISIBILITY_TIMEOUT},
        queue::RedisTaskQueue,
    },
    realtime::NotifierHandle,
    services::{
        fulfillment_client::HttpFulfillmentClient, lease::RedisLeaseLock,
        orchestrator::Orchestrator, order_store::PgOrderStore,
    },
    state::{AppState, WebhookSecrets},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::from_env()?;
    let provider_endpoint = config.provider_transaction_url()?;
    let cutoff_offset = config.cutoff_offset()?;
    tracing::info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Redis connection established");

    let store = Arc::new(PgOrderStore::new(pool));
    let queue = Arc::new(RedisTaskQueue::new(redis.clone(), VISIBILITY_TIMEOUT));
    let notifier = NotifierHandle::spawn(store.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(RedisLeaseLock::new(redis)),
        Arc::new(HttpFulfillmentClient::new(
            provider_endpoint,
            config.provider_username.clone(),
            config.provider_prod_key.clone(),
        )),
        notifier.clone(),
        cutoff_offset,
    ));

    Dispatcher::new(queue.clone(), orchestrator, config.worker_concurrency).spawn();

    let state = AppState {
        store,
        queue,
        notifier,
        secrets: WebhookSecrets {
            payment_server_key: config.payment_server_key.clone(),
            provider_webhook_secret: config.provider_webhook_secret.clone(),
        },
    };

    let cors = CorsLayer::new()
        .allow_origin(config.cors_allowed_origin.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = handlers::router(state)
        .layer(cors)
        // Add distributed tracing middleware for observability
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
