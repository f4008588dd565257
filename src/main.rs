//! Signalpost binary entry point

use signalpost::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background delivery worker
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("SIGNALPOST__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "signalpost=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "signalpost=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Signalpost...");

    // 2. Initialize metrics
    signalpost::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        actor = %config.actor.url,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = signalpost::build_router(state.clone());

    // 6. Start background delivery worker
    spawn_delivery_worker(state.clone());

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Spawn the background delivery worker
///
/// Each run drains one bounded batch from the queue plus pending Accept
/// replies; redelivery isolation comes from the queue's visibility leases,
/// so overlapping runs never block each other.
fn spawn_delivery_worker(state: AppState) {
    tokio::spawn(async move {
        let interval_secs = state.config.delivery.interval_seconds.max(1);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        let worker = state.delivery_worker();

        loop {
            interval.tick().await;

            match worker.run_once().await {
                Ok(stats) => {
                    if stats.delivered > 0
                        || stats.permanent_failures > 0
                        || stats.transient_failures > 0
                    {
                        tracing::info!(?stats, "Delivery run finished");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Delivery run failed");
                }
            }
        }
    });

    tracing::info!("Delivery worker spawned");
}
