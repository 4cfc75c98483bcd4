use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use overlay_relay::api::{HttpSnapshotApi, SnapshotApi};
use overlay_relay::config::Settings;
use overlay_relay::relay::RelayService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let api: Arc<dyn SnapshotApi> = Arc::new(HttpSnapshotApi::new(&settings.api)?);

    // Start the distribution layer
    let service = RelayService::init(&settings, api);

    // Surface connection status transitions on the operator console
    let mut state_changes = service.manager().state_changes();
    let status_task = tokio::spawn(async move {
        while state_changes.changed().await.is_ok() {
            let status = state_changes.borrow_and_update().to_string();
            tracing::info!(status = %status, "Upstream status");
        }
    });

    shutdown_signal().await;

    service.shutdown().await;
    status_task.abort();

    tracing::info!("Relay shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
