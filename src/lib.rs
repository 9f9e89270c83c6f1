pub mod config;
pub mod engine;
pub mod enricher;
pub mod error;
pub mod job;
pub mod negotiator;
pub mod policy;
pub mod relay;
pub mod server;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, prelude::*, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::policy::{ConfigPolicyStore, PolicyStore};

/// Install the global tracing subscriber
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.log_to_file {
        let file = std::fs::File::create(&logging.log_file_path)
            .with_context(|| format!("Failed to create log file {}", logging.log_file_path))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .with_filter(filter());

        tracing_subscriber::registry()
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(filter()),
            )
            .try_init()
            .context("Failed to initialize logging")?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(filter()),
            )
            .try_init()
            .context("Failed to initialize logging")?;
    }
    Ok(())
}

/// Serve every configured printer until Ctrl-C
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn PolicyStore> = Arc::new(ConfigPolicyStore::from_config(&config)?);
    tracing::info!("🔧 Starting print SCP with {} printers", store.printers().len());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("🛑 Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server::serve(&config.server, store, shutdown).await
}
