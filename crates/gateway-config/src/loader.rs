//! Configuration loading with environment overrides.

use crate::config::GatewayConfig;
use gateway_core::{GatewayError, GatewayResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "aibalance.yaml";

/// Environment variable overriding the listen address
pub const ENV_LISTEN: &str = "BALANCER_LISTEN";
/// Environment variable overriding the database URL
pub const ENV_DATABASE_URL: &str = "BALANCER_DATABASE_URL";
/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "BALANCER_LOG_LEVEL";

/// Builder-style configuration loader
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_overrides: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            file: None,
            env_overrides: true,
        }
    }
}

impl ConfigLoader {
    /// Create a loader that looks for the default file
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from an explicit file, which must exist
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Enable or disable environment overrides
    #[must_use]
    pub fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    /// Load, apply overrides and validate
    ///
    /// # Errors
    /// Returns an error when an explicit file is missing or any file fails
    /// to parse or validate
    pub async fn load(&self) -> GatewayResult<GatewayConfig> {
        let mut config = match &self.file {
            Some(path) => read_file(path).await?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    read_file(path).await?
                } else {
                    warn!(
                        file = DEFAULT_CONFIG_FILE,
                        "No configuration file found, using defaults"
                    );
                    GatewayConfig::default()
                }
            }
        };

        if self.env_overrides {
            apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Load configuration from an optional path
///
/// # Errors
/// See [`ConfigLoader::load`]
pub async fn load_config(path: Option<&Path>) -> GatewayResult<GatewayConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader.load().await
}

/// Parse a YAML document
///
/// # Errors
/// Returns a configuration error on invalid YAML
pub fn parse_yaml(text: &str) -> GatewayResult<GatewayConfig> {
    serde_yaml::from_str(text)
        .map_err(|e| GatewayError::configuration(format!("invalid YAML: {e}")))
}

async fn read_file(path: &Path) -> GatewayResult<GatewayConfig> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        GatewayError::configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let config = parse_yaml(&text)?;
    info!(
        file = %path.display(),
        models = config.models.len(),
        keys = config.keys.len(),
        "Configuration file loaded"
    );
    Ok(config)
}

fn apply_env_overrides(config: &mut GatewayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(listen) = lookup(ENV_LISTEN) {
        config.server.listen = listen;
    }
    if let Some(url) = lookup(ENV_DATABASE_URL) {
        config.database.url = Some(url);
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
}
