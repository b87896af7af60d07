//! Conductor Engine - standalone job scheduler daemon.
//!
//! Runs one process engine on the in-memory store and registers it with every
//! configured acquisition until Ctrl-C or SIGTERM.

use std::sync::Arc;

use conductor_core::{
    config::Config,
    engine::ProcessEngine,
    execution::RecordingRuntime,
    jobs::JobScheduler,
    persistence::InMemoryStore,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match std::env::var("CONDUCTOR_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    config.validate()?;

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = %config.engine.name,
        acquisitions = config.scheduler.acquisitions.len(),
        "Starting Conductor Engine"
    );

    let engine = ProcessEngine::from_config(config.engine.clone())
        .with_store(Arc::new(InMemoryStore::new()))
        .with_runtime(Arc::new(RecordingRuntime::new()))
        .build()?;

    let scheduler = JobScheduler::new(config.scheduler.clone());
    for acquisition in scheduler.acquisition_names() {
        scheduler.register_engine(&acquisition, engine.clone()).await?;
    }

    shutdown_signal().await;

    scheduler.shutdown().await;
    tracing::debug!(snapshot = %telemetry.metrics.render(), "Final metrics");
    telemetry.shutdown();
    tracing::info!("Conductor Engine shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
