use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crewflow_integrations::config::ConfigLoader;
use crewflow_integrations::server::{AppState, run_server};
use crewflow_integrations::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    init_tracing(&config).context("failed to initialize tracing")?;
    let redacted = config
        .redacted_json()
        .unwrap_or_else(|_| "<unserializable>".to_string());
    info!(
        profile = %config.profile,
        config = %redacted,
        "Starting crewflow-integrations"
    );

    let state = AppState::from_config(Arc::clone(&config))?;

    let shutdown = CancellationToken::new();
    let maintenance = Arc::clone(&state.maintenance);
    let maintenance_shutdown = shutdown.clone();
    let maintenance_task = tokio::spawn(async move {
        maintenance.run(maintenance_shutdown).await;
    });

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        server_shutdown.cancel();
    });

    let result = run_server(state, shutdown.clone()).await;
    shutdown.cancel();

    if let Err(err) = maintenance_task.await {
        error!(error = %err, "Maintenance task panicked");
    }

    result
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
