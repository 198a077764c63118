use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use interpose::{Config, ConnectionDispatcher, ProxyContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting {} {}", interpose::NAME, interpose::VERSION);

    let config = Config::from_env()?;
    let ctx = ProxyContext::from_config(&config).context("Failed to load CA material")?;
    info!(
        ca_cert = %config.ca_cert_path.display(),
        cache_dir = %config.cert_cache_dir.display(),
        "Certificate store ready"
    );

    let dispatcher = ConnectionDispatcher::bind(&config, Arc::new(ctx))?;
    dispatcher.run(shutdown_signal()).await
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
