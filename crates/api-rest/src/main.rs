//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own, without bootstrapping the database.
//!
//! ## Intended use
//! Useful for development and debugging against an already bootstrapped database. The
//! workspace's main `ngs-run` binary bootstraps first and then serves the same router.

use api_rest::{router, ApiState};
use ngs_core::CoreConfig;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the NGS REST API server
///
/// # Environment Variables
/// - `NGS_REST_ADDR`: Server address (default: "0.0.0.0:8000")
/// - store and pipeline settings as read by [`CoreConfig::from_lookup`]
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the configuration is invalid,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("NGS_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());

    let cfg = Arc::new(CoreConfig::from_lookup(|key| std::env::var(key).ok())?);
    let store = cfg.open_store()?;

    tracing::info!(
        database = cfg.database_name(),
        backend = ?cfg.backend(),
        "-- Starting NGS REST API on {}",
        addr
    );

    let app = router(ApiState::new(cfg, store));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
