//! Subcommand implementations.

pub mod providers;
pub mod serve;
pub mod validate;

use anyhow::{bail, Context, Result};
use gateway_config::GatewayConfig;
use gateway_store::{PoolConfig, SqlStore};

/// Open the configured database, preferring an explicit URL.
pub async fn open_store(config: &GatewayConfig, url_override: Option<&str>) -> Result<SqlStore> {
    let Some(url) = url_override.or(config.database.url.as_deref()) else {
        bail!("no database configured, pass --database-url or set database.url");
    };
    SqlStore::connect(url, &PoolConfig::default())
        .await
        .with_context(|| format!("failed to open database {url}"))
}
