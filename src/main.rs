use api_rest::{router, ApiState};
use ngs_core::{catalog, sequencer, CoreConfig, Session};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the NGS run tracker
///
/// Prepares the database and then serves the REST API:
/// - creates the database if it is missing and installs the index catalog (idempotent)
/// - indexes the sequencer output directory once, when one is configured
/// - serves REST with Swagger UI on `NGS_REST_ADDR`
///
/// # Environment Variables
/// - `NGS_REST_ADDR`: REST server address (default: "0.0.0.0:8000")
/// - `NGS_STORE`: `couchdb` (default) or `memory`
/// - `COUCHDB_URL`, `COUCHDB_USER`, `COUCHDB_PASSWORD`, `NGS_DB_NAME`: store connection
/// - `NGS_CONFIG`: JSON config file with the same settings
/// - `MISEQ_OUTPUT_DIR`: sequencer output directory to index
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If bootstrap, server startup or runtime fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("ngs=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("NGS_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());

    let cfg = Arc::new(CoreConfig::from_lookup(|key| std::env::var(key).ok())?);
    let store = cfg.open_store()?;

    let session = Session::new(store.clone()).initialise_database().await?;
    let report = catalog::bootstrap(&session).await?;
    tracing::info!(
        "++ Bootstrapped {} ({} document(s) written)",
        session.database_name(),
        report.writes()
    );

    if let Some(dir) = cfg.sequencer_output_dir() {
        match sequencer::index_sequencer_output(&session, dir).await {
            Ok(report) => tracing::info!(
                "++ Indexed {} new sequencer run(s) from {}",
                report.indexed.len() + report.dirty.len(),
                dir.display()
            ),
            Err(e) => tracing::warn!("Could not index {}: {}", dir.display(), e),
        }
    }

    tracing::info!("++ Starting NGS REST on {}", rest_addr);

    let app = router(ApiState::new(cfg, store));
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
