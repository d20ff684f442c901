//! # Gateway Config
//!
//! Declarative configuration for the LLM Balance Gateway.
//!
//! The YAML document lists caller keys, logical models with their upstream
//! providers, and tuning for the health loops and auxiliary proxies. A
//! missing default file is not an error: providers may come from storage.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod loader;

pub use config::{
    AmapSettings, DatabaseSettings, GatewayConfig, HealthSettings, KeyConfig, LoggingSettings,
    ModelConfig, PoolKeyConfig, ProviderConfig, ServerSettings, WebSearchSettings,
};
pub use loader::{load_config, parse_yaml, ConfigLoader, DEFAULT_CONFIG_FILE};
