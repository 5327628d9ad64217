//! Tabmate server: shared restaurant tables over WebSocket and HTTP.
//!
//! Run with: cargo run -p tabmate-server -- --identities users.json

mod config;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tabmate_core::Store;
use tabmate_session::{SessionRegistry, StaticIdentity, storage::MemoryStore};
use tabmate_transport::AppState;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    logging::init(config.log_format);

    let identity = load_identities(&config)?;

    match config.database_url.as_deref() {
        #[cfg(feature = "sqlite")]
        Some(url) => {
            let store = tabmate_session::storage::SqliteStore::connect(url, config.db_connections)
                .await
                .with_context(|| format!("Failed to open database {url}"))?;
            info!(component = "storage", backend = "sqlite", "Store ready");
            serve(&config, Arc::new(store), identity).await
        }
        #[cfg(not(feature = "sqlite"))]
        Some(_) => {
            warn!(
                component = "storage",
                "DATABASE_URL ignored: built without the sqlite feature, using memory"
            );
            serve(&config, Arc::new(MemoryStore::new()), identity).await
        }
        None => {
            info!(component = "storage", backend = "memory", "Store ready");
            serve(&config, Arc::new(MemoryStore::new()), identity).await
        }
    }
}

fn load_identities(config: &Config) -> anyhow::Result<StaticIdentity> {
    let Some(path) = &config.identities else {
        warn!(
            component = "identity",
            "No identities file configured; every request will be rejected"
        );
        return Ok(StaticIdentity::new());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read identities from {}", path.display()))?;
    let identity = StaticIdentity::from_json(&json)
        .with_context(|| format!("Invalid identities file {}", path.display()))?;
    info!(component = "identity", users = identity.len(), "Identities loaded");
    Ok(identity)
}

async fn serve<S: Store>(
    config: &Config,
    store: Arc<S>,
    identity: StaticIdentity,
) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new(store, config.hub()));
    if config.no_warm_start {
        info!(component = "registry", "Warm start skipped");
    } else {
        registry
            .warm_start()
            .await
            .context("Failed to restore open tables")?;
    }

    let state = AppState::new(registry, Arc::new(identity))
        .with_connection_config(config.connection());
    let app = tabmate_transport::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    info!(component = "server", addr = %config.addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(component = "server", error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(component = "server", "Shutting down");
}
