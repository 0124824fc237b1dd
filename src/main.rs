use anyhow::Context;

use extraction_worker::config::WorkerConfig;
use extraction_worker::context::AppContext;
use extraction_worker::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    telemetry::init(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        workers = ?config.run_workers,
        "Extraction worker starting"
    );

    let app = AppContext::connect(config)
        .await
        .context("Failed to connect to backing services")?;

    app.lifecycle()
        .run()
        .await
        .context("Worker pool did not shut down cleanly")?;

    tracing::info!("Extraction worker exited");
    Ok(())
}
