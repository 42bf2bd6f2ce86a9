//! xrm controller
//!
//! Loads managed resources from a manifest and keeps reconciling them
//! against the in-memory provider APIs until interrupted.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xrm_controller::{
    config::Config,
    manifest::Manifest,
    registry::Providers,
    scheduler::{Scheduler, SchedulerConfig},
    store::ResourceStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to XRM_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting xrm controller");

    let manifest = match &config.manifest_path {
        Some(path) => Manifest::load(path).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load manifest");
        })?,
        None => {
            warn!("XRM_MANIFEST not set, starting with an empty store");
            Manifest::default()
        }
    };

    let providers = Providers::seeded(&manifest.seed);
    let store = ResourceStore::new();
    manifest.populate(&store);

    let registry = providers.registry(&store, config.selection_policy);
    info!(
        resources = store.len(),
        kinds = ?registry.kinds().collect::<Vec<_>>(),
        selection_policy = ?config.selection_policy,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(store, registry, SchedulerConfig::from(&config));
    let mut scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut scheduler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Scheduler task panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight passes to finish...");
    let shutdown_timeout = config.pass_timeout + std::time::Duration::from_secs(5);
    if tokio::time::timeout(shutdown_timeout, scheduler_handle)
        .await
        .is_err()
    {
        warn!("Scheduler did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
