//! Discovery workflow orchestrator.
//!
//! Drives long-running document-processing pipelines across a remote step
//! worker: workflow CRUD, synchronous and asynchronous execution, status
//! polling and a per-execution websocket progress channel.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use discovery::config::{AppState, Config};
use discovery::handlers;
use discovery::store::{MemStore, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "discovery=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let bind_addr = config.bind_addr();

    info!("Starting Discovery workflow orchestrator");
    info!("Worker base URL: {}", config.worker_base_url);
    info!("Binding to: {}", bind_addr);

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            let store = PgStore::new(database_url)
                .await
                .context("Failed to connect to database")?;
            info!("Using PostgreSQL store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set - using in-process store, state will not survive restarts");
            Arc::new(MemStore::new())
        }
    };

    let state = AppState::new(config, store);
    let app = handlers::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed")?;

    info!("Discovery shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
