//! Configuration schema.

use gateway_core::{ApiKey, GatewayError, GatewayResult, ProviderSpec};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and timeouts
    #[serde(default)]
    pub server: ServerSettings,

    /// Caller keys
    #[serde(default)]
    pub keys: Vec<KeyConfig>,

    /// Logical models and their providers
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Background health checking
    #[serde(default)]
    pub health: HealthSettings,

    /// Geocoding passthrough
    #[serde(default)]
    pub amap: AmapSettings,

    /// Web-search relay
    #[serde(default)]
    pub web_search: WebSearchSettings,

    /// Persistence
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Logging
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Deadline for reading one request from a connection
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Bound on a single upstream call
    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    pub upstream_timeout: Duration,

    /// Deadline for the free-tier rate-limit wait
    #[serde(with = "humantime_serde", default = "default_rate_limit_wait")]
    pub rate_limit_wait: Duration,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen() -> String {
    "127.0.0.1:8223".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_limit_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout: default_read_timeout(),
            upstream_timeout: default_upstream_timeout(),
            rate_limit_wait: default_rate_limit_wait(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// A caller key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Bearer token
    pub key: String,

    /// Models the key may call
    #[serde(default)]
    pub allowed_models: Vec<String>,

    /// Optional traffic quota in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_limit: Option<u64>,
}

impl KeyConfig {
    /// Convert into the runtime key type
    #[must_use]
    pub fn to_api_key(&self) -> ApiKey {
        ApiKey::new(self.key.clone(), self.allowed_models.iter().cloned())
    }
}

/// A logical model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name callers use
    pub name: String,

    /// Upstreams serving the model
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// One upstream of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Client type
    pub type_name: String,

    /// Domain or base URL
    #[serde(default)]
    pub domain_or_url: String,

    /// Upstream credential
    #[serde(skip_serializing, default = "empty_secret")]
    pub api_key: SecretString,

    /// Upstream model name; defaults to the logical name
    #[serde(default)]
    pub model_name: String,

    /// Use plain HTTP
    #[serde(default)]
    pub no_https: bool,

    /// Optional reasoning budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

/// Health checking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Run the background loops
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Full sweep interval
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub interval: Duration,

    /// Per-probe timeout
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,

    /// First-byte latency below which a provider is healthy
    #[serde(with = "humantime_serde", default = "default_healthy_latency")]
    pub healthy_latency: Duration,

    /// Probes in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Fast re-probe cadence for problematic providers
    #[serde(with = "humantime_serde", default = "default_fast_interval")]
    pub fast_interval: Duration,

    /// Latency at or above which a provider is problematic
    #[serde(with = "humantime_serde", default = "default_problematic_latency")]
    pub problematic_latency: Duration,
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_healthy_latency() -> Duration {
    Duration::from_millis(3000)
}

fn default_concurrency() -> usize {
    5
}

fn default_fast_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_problematic_latency() -> Duration {
    Duration::from_secs(10)
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            probe_timeout: default_probe_timeout(),
            healthy_latency: default_healthy_latency(),
            concurrency: default_concurrency(),
            fast_interval: default_fast_interval(),
            problematic_latency: default_problematic_latency(),
        }
    }
}

/// Geocoding passthrough settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmapSettings {
    /// Upstream base URL
    #[serde(default = "default_amap_url")]
    pub base_url: String,

    /// Allow anonymous trace-id callers
    #[serde(default = "default_true")]
    pub allow_free_users: bool,

    /// Keys loaded into the store at startup
    #[serde(default)]
    pub keys: Vec<PoolKeyConfig>,
}

fn default_amap_url() -> String {
    "https://restapi.amap.com".to_string()
}

impl Default for AmapSettings {
    fn default() -> Self {
        Self {
            base_url: default_amap_url(),
            allow_free_users: true,
            keys: Vec::new(),
        }
    }
}

/// Web-search relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchSettings {
    /// Allow anonymous trace-id callers
    #[serde(default = "default_true")]
    pub allow_free_users: bool,

    /// One-time-code shared secret; verification is off when absent
    #[serde(default, skip_serializing)]
    pub otp_secret: Option<SecretString>,

    /// Traffic charged per paid search, in bytes
    #[serde(default = "default_search_cost")]
    pub traffic_per_search: u64,

    /// Keys loaded into the store at startup
    #[serde(default)]
    pub keys: Vec<PoolKeyConfig>,
}

fn default_search_cost() -> u64 {
    4096
}

impl Default for WebSearchSettings {
    fn default() -> Self {
        Self {
            allow_free_users: true,
            otp_secret: None,
            traffic_per_search: default_search_cost(),
            keys: Vec::new(),
        }
    }
}

/// A geocoding or search key declared in config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolKeyConfig {
    /// Searcher type for web-search keys; ignored for geocoding
    #[serde(default)]
    pub sub_type: String,

    /// Credential
    #[serde(skip_serializing, default = "empty_secret")]
    pub api_key: SecretString,

    /// Optional upstream override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite URL; in-memory store when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Check structural consistency
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found
    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen = HashSet::new();
        for key in &self.keys {
            if key.key.trim().is_empty() {
                return Err(GatewayError::configuration("key with empty value"));
            }
            if !seen.insert(key.key.as_str()) {
                return Err(GatewayError::configuration(format!(
                    "duplicate key {}",
                    gateway_core::mask_secret(&key.key)
                )));
            }
        }
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(GatewayError::configuration("model with empty name"));
            }
            for provider in &model.providers {
                if provider.type_name.trim().is_empty() {
                    return Err(GatewayError::configuration(format!(
                        "provider of model {} has no type_name",
                        model.name
                    )));
                }
            }
        }
        if self.health.concurrency == 0 {
            return Err(GatewayError::configuration(
                "health.concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    /// Caller keys as runtime values, paired with their quotas
    #[must_use]
    pub fn api_keys(&self) -> Vec<(ApiKey, Option<u64>)> {
        self.keys
            .iter()
            .map(|k| (k.to_api_key(), k.traffic_limit))
            .collect()
    }

    /// Flatten models into provider specs
    #[must_use]
    pub fn provider_specs(&self) -> Vec<ProviderSpec> {
        self.models
            .iter()
            .flat_map(|model| {
                model.providers.iter().map(move |p| ProviderSpec {
                    wrapper_name: model.name.clone(),
                    model_name: if p.model_name.is_empty() {
                        model.name.clone()
                    } else {
                        p.model_name.clone()
                    },
                    type_name: p.type_name.clone(),
                    domain_or_url: p.domain_or_url.clone(),
                    api_key: p.api_key.clone(),
                    no_https: p.no_https,
                    reasoning_budget: p.reasoning_budget,
                })
            })
            .collect()
    }
}
