//! # LLM Balance Gateway
//!
//! Failover load balancer for OpenAI-compatible chat completions, with
//! geocoding and web-search relays.
//!
//! ## Usage
//!
//! ```bash
//! # Start with aibalance.yaml from the working directory
//! llm-balance-gateway
//!
//! # Start with a custom config file
//! BALANCER_CONFIG=/etc/aibalance.yaml llm-balance-gateway
//!
//! # Override the listen address
//! BALANCER_LISTEN=0.0.0.0:9000 llm-balance-gateway
//! ```

use anyhow::Context;
use gateway_config::{load_config, GatewayConfig};
use gateway_core::{MemoryStore, ProviderStore};
use gateway_store::{PoolConfig, SqlStore};
use gateway_telemetry::{init_logging, LoggingConfig};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Environment variable naming the configuration file
const ENV_CONFIG: &str = "BALANCER_CONFIG";

/// Application entry point
#[tokio::main]
async fn main() {
    let config = match load_config(config_path().as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };

    let logging = LoggingConfig::new(config.logging.level.clone()).with_json(config.logging.json);
    if let Err(e) = init_logging(&logging) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        "Starting LLM Balance Gateway"
    );

    if let Err(e) = run(&config).await {
        error!("Application failed: {e:#}");
        std::process::exit(1);
    }
}

fn config_path() -> Option<PathBuf> {
    env::var_os(ENV_CONFIG).map(PathBuf::from)
}

/// Main application logic
async fn run(config: &GatewayConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    gateway_server::serve(config, store).await?;
    info!("Gateway stopped");
    Ok(())
}

async fn open_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn ProviderStore>> {
    match config.database.url.as_deref() {
        Some(url) => {
            let store = SqlStore::connect(url, &PoolConfig::default())
                .await
                .with_context(|| format!("failed to open database {url}"))?;
            info!("Provider database opened");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, provider stats are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
