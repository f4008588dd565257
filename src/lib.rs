//! Signalpost - a federation delivery engine for a single-actor
//! ActivityPub site
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox endpoint (inbound activities)                      │
//! │  - Delivery trigger (publishing pipeline)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Layer                           │
//! │  - HTTP Signatures (sign/verify)                            │
//! │  - Inbox processing, fan-out planning                       │
//! │  - Delivery worker with retry classification                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Follower registry, delivery status (SQLite/sqlx)         │
//! │  - Durable delivery queue with visibility leases            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the inbox and the delivery trigger
//! - `federation`: signatures, verification, processing, delivery
//! - `data`: database and durable queue
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool, the delivery queue
/// and the HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Durable delivery queue
    pub queue: data::DeliveryQueue,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Signing capability for outbound requests
    pub signer: Arc<dyn federation::Signer>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Open the delivery queue over the same pool
    /// 3. Initialize HTTP client
    /// 4. Load the signing key
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        // 2. Open the delivery queue
        let queue = data::DeliveryQueue::new(
            db.pool(),
            config.delivery.visibility_timeout_seconds,
            config.delivery.max_delivery_count,
        );

        // 3. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(std::time::Duration::from_secs(
                config.delivery.request_timeout_seconds,
            ))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        // 4. Load the signing key
        let signer = federation::LocalKeySigner::from_config(&config.signing, config.actor.key_id())?;
        tracing::info!(key_id = %config.actor.key_id(), "Signing key loaded");

        // Prime the follower gauge
        if let Ok(count) = db.follower_count().await {
            metrics::FOLLOWERS_TOTAL.set(count);
        }

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db: Arc::new(db),
            queue,
            http_client: Arc::new(http_client),
            signer: Arc::new(signer),
        })
    }

    /// Build a delivery worker over this state
    pub fn delivery_worker(&self) -> federation::DeliveryWorker {
        federation::DeliveryWorker::new(
            self.db.clone(),
            self.queue.clone(),
            self.http_client.clone(),
            self.signer.clone(),
            self.config.delivery.clone(),
            self.config.user_agent(),
        )
    }
}

/// Maximum accepted inbound request body size
const MAX_INBOUND_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::inbox_router())
        .merge(api::delivery_router())
        .layer(axum::extract::DefaultBodyLimit::max(MAX_INBOUND_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
