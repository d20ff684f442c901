//! `validate`: load a configuration and summarize it.

use anyhow::{Context, Result};
use gateway_config::GatewayConfig;
use serde::Serialize;
use std::path::Path;

use crate::output::{self, OutputFormat};

/// What a configuration file declares
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ConfigSummary {
    /// Listen address
    pub listen: String,
    /// Caller keys
    pub keys: usize,
    /// Configured models
    pub models: usize,
    /// Models anyone may call
    pub free_models: usize,
    /// Providers across all models
    pub providers: usize,
    /// Geocoding pool keys
    pub amap_keys: usize,
    /// Web-search pool keys
    pub search_keys: usize,
    /// Whether a database is configured
    pub database: bool,
    /// Whether health monitoring runs
    pub health_checks: bool,
}

impl From<&GatewayConfig> for ConfigSummary {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            listen: config.server.listen.clone(),
            keys: config.keys.len(),
            models: config.models.len(),
            free_models: config
                .models
                .iter()
                .filter(|model| model.name.ends_with(gateway_core::FREE_MODEL_SUFFIX))
                .count(),
            providers: config.models.iter().map(|model| model.providers.len()).sum(),
            amap_keys: config.amap.keys.len(),
            search_keys: config.web_search.keys.len(),
            database: config.database.url.is_some(),
            health_checks: config.health.enabled,
        }
    }
}

/// Execute the validate command
pub async fn execute(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = gateway_config::load_config(config_path)
        .await
        .context("configuration is invalid")?;
    let summary = ConfigSummary::from(&config);

    match OutputFormat::from_json_flag(json) {
        OutputFormat::Json => output::json(&summary)?,
        OutputFormat::Text => {
            output::success("Configuration is valid");
            output::key_value("Listen", &summary.listen);
            output::key_value("Keys", &summary.keys.to_string());
            output::key_value(
                "Models",
                &format!("{} ({} free)", summary.models, summary.free_models),
            );
            output::key_value("Providers", &summary.providers.to_string());
            output::key_value("Amap keys", &summary.amap_keys.to_string());
            output::key_value("Search keys", &summary.search_keys.to_string());
            if summary.models == 0 && !summary.database {
                output::warning("No models and no database: every chat request will fail");
            }
            if !summary.health_checks {
                output::info("Health monitoring is disabled");
            }
        }
    }
    Ok(())
}
