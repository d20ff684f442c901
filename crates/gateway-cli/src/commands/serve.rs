//! `serve`: run the balancer in the foreground.

use anyhow::{Context, Result};
use clap::Args;
use gateway_core::{MemoryStore, ProviderStore};
use gateway_telemetry::{init_logging, LoggingConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::open_store;

/// Arguments for the serve command
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address, overrides server.listen
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Skip the health checker and latency watcher
    #[arg(long)]
    pub no_health: bool,
}

/// Log level after applying `-v` flags
pub fn effective_level(configured: &str, verbose: u8) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Execute the serve command
pub async fn execute(args: ServeArgs, config_path: Option<&Path>, verbose: u8) -> Result<()> {
    let mut config = gateway_config::load_config(config_path)
        .await
        .context("failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if args.no_health {
        config.health.enabled = false;
    }

    let logging = LoggingConfig::new(effective_level(&config.logging.level, verbose))
        .with_json(config.logging.json);
    init_logging(&logging)?;

    let store: Arc<dyn ProviderStore> = if config.database.url.is_some() {
        Arc::new(open_store(&config, None).await?)
    } else {
        warn!("No database configured, provider stats will not survive a restart");
        Arc::new(MemoryStore::new())
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        "Starting balancer"
    );
    gateway_server::serve(&config, store).await?;
    info!("Balancer stopped");
    Ok(())
}
