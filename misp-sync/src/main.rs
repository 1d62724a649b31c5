use anyhow::{Context, Result};
use nnoe_misp_sync::backfill::AlertBackfillWorker;
use nnoe_misp_sync::config::MispSyncConfig;
use nnoe_misp_sync::ingestion::IngestionPipeline;
use nnoe_misp_sync::registry::InstanceRegistry;
use nnoe_misp_sync::scheduler::Scheduler;
use nnoe_misp_sync::store::{EventBus, FilesystemTempStore, InMemoryAlertStore, InMemoryArtifactStore, InMemoryCaseStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("misp_sync=info")
        .init();

    info!("Starting MISP synchronization connector");

    let config_path = std::env::var("MISP_SYNC_CONFIG").unwrap_or_else(|_| "misp-sync.toml".to_string());
    let config = match MispSyncConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %config_path, error = %e, "config file not found or invalid, using defaults");
            MispSyncConfig::default_config()
        }
    };

    let registry = Arc::new(InstanceRegistry::new(config.instance_configs()));
    info!(instances = registry.len(), interval_secs = config.interval_secs, "loaded configuration");

    let alerts = Arc::new(InMemoryAlertStore::new());
    let case_store = InMemoryCaseStore::new();
    let case_artifacts = Arc::new(InMemoryArtifactStore::new(case_store.shared()));
    let cases = Arc::new(case_store);
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let temp = Arc::new(
        FilesystemTempStore::new(std::env::temp_dir().join("misp-sync"))
            .context("failed to initialize temp store")?,
    );

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&registry),
        Arc::clone(&alerts) as _,
        Arc::clone(&cases) as _,
        Arc::clone(&case_artifacts) as _,
        http.clone(),
    ));

    // The platform's migration-state readiness gate; always ready in
    // this standalone wiring.
    let ready = Arc::new(AtomicBool::new(true));
    let readiness = {
        let ready = Arc::clone(&ready);
        Arc::new(move || ready.load(Ordering::Relaxed))
    };

    let scheduler = Scheduler::new(Arc::clone(&pipeline), temp as _, readiness, config.interval());
    let (scheduler_handle, stop_handle) = scheduler.spawn();

    let event_bus = Arc::new(EventBus::new());
    if let Some(receiver) = event_bus.take_receiver().await {
        let worker = Arc::new(AlertBackfillWorker::new(
            Arc::clone(&registry),
            Arc::clone(&alerts) as _,
            http,
        ));
        tokio::spawn(worker.run(receiver));
    }

    info!("connector running, waiting for shutdown signal");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("received shutdown signal");

    stop_handle.stop();
    let _ = scheduler_handle.await;

    Ok(())
}
