//! `register-provider` and `list-providers`.

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use gateway_core::{ClientOptions, ProviderRecord, ProviderSpec, ProviderStore};
use gateway_providers::ClientRegistry;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tabled::Tabled;
use tracing::info;

use super::open_store;
use crate::output::{self, OutputFormat};

/// Arguments for the register-provider command
#[derive(Args, Debug)]
pub struct RegisterProviderArgs {
    /// Model name callers ask for
    #[arg(short, long)]
    pub model: String,

    /// Model name sent upstream, defaults to --model
    #[arg(long)]
    pub upstream_model: Option<String>,

    /// Client type
    #[arg(short = 't', long = "type", default_value = "openai")]
    pub type_name: String,

    /// Upstream domain or base URL
    #[arg(short, long, default_value = "")]
    pub domain: String,

    /// Upstream API key
    #[arg(long, env = "BALANCER_PROVIDER_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Talk plain HTTP to the upstream
    #[arg(long)]
    pub no_https: bool,

    /// Reasoning token budget
    #[arg(long)]
    pub reasoning_budget: Option<u32>,

    /// Send a test prompt upstream before storing
    #[arg(long)]
    pub verify: bool,

    /// Seconds the test prompt may take
    #[arg(long, default_value_t = 30)]
    pub verify_timeout_secs: u64,

    /// Database URL, overrides database.url
    #[arg(long)]
    pub database_url: Option<String>,
}

impl RegisterProviderArgs {
    fn to_spec(&self) -> ProviderSpec {
        let upstream = self.upstream_model.as_deref().unwrap_or(&self.model);
        let spec = ProviderSpec::new(&self.model, upstream, &self.type_name, &self.api_key)
            .with_domain(&self.domain)
            .with_no_https(self.no_https);
        match self.reasoning_budget {
            Some(budget) => spec.with_reasoning_budget(budget),
            None => spec,
        }
    }
}

/// Arguments for the list-providers command
#[derive(Args, Debug)]
pub struct ListProvidersArgs {
    /// Only show providers serving this model
    #[arg(short, long)]
    pub model: Option<String>,

    /// Database URL, overrides database.url
    #[arg(long)]
    pub database_url: Option<String>,
}

/// Provider row for table display
#[derive(Debug, Tabled)]
pub struct ProviderRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Upstream")]
    upstream: String,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "Requests")]
    requests: u64,
    #[tabled(rename = "Failures")]
    failures: u64,
    #[tabled(rename = "Latency (ms)")]
    latency_ms: i64,
    #[tabled(rename = "Last Check")]
    last_checked: String,
}

impl From<&ProviderRecord> for ProviderRow {
    fn from(record: &ProviderRecord) -> Self {
        let counters = &record.counters;
        Self {
            id: record.id,
            model: record.spec.wrapper_name.clone(),
            upstream: record.spec.describe(),
            health: output::health_label(counters.healthy, counters.first_check_completed),
            requests: counters.total_requests,
            failures: counters.failure_count,
            latency_ms: counters.last_latency_ms,
            last_checked: output::format_timestamp(counters.last_checked_at),
        }
    }
}

/// Send one test prompt through a freshly built client
pub async fn verify(registry: &ClientRegistry, spec: &ProviderSpec, limit: Duration) -> Result<()> {
    let client = registry
        .build(&spec.type_name, &ClientOptions::from_spec(spec, limit))
        .with_context(|| format!("failed to build a client for {}", spec.describe()))?;
    tokio::time::timeout(limit, client.check_valid())
        .await
        .map_err(|_| anyhow!("{} did not answer within {limit:?}", spec.describe()))?
        .with_context(|| format!("{} failed verification", spec.describe()))?;
    info!(upstream = %spec.describe(), "Provider verified");
    Ok(())
}

/// Validate and store a provider
pub async fn register(
    store: &dyn ProviderStore,
    registry: &ClientRegistry,
    args: &RegisterProviderArgs,
) -> Result<ProviderRecord> {
    if !registry.supports(&args.type_name) {
        bail!(
            "unknown provider type {}, expected one of: {}",
            args.type_name,
            registry.types().join(", ")
        );
    }
    if args.api_key.trim().is_empty() {
        bail!("api key must not be empty");
    }
    let spec = args.to_spec();
    if args.verify {
        verify(registry, &spec, Duration::from_secs(args.verify_timeout_secs)).await?;
    }
    let record = store
        .upsert_provider(&spec)
        .await
        .context("failed to store provider")?;
    Ok(record)
}

/// Active providers, optionally filtered by model
pub async fn list(store: &dyn ProviderStore, model: Option<&str>) -> Result<Vec<ProviderRecord>> {
    let mut records = store.active_providers().await?;
    if let Some(model) = model {
        records.retain(|record| record.spec.wrapper_name == model);
    }
    records.sort_by(|a, b| {
        a.spec
            .wrapper_name
            .cmp(&b.spec.wrapper_name)
            .then(a.id.cmp(&b.id))
    });
    Ok(records)
}

/// Execute the register-provider command
pub async fn execute_register(
    args: RegisterProviderArgs,
    config_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = gateway_config::load_config(config_path).await?;
    let store = open_store(&config, args.database_url.as_deref()).await?;
    let record = register(&store, &ClientRegistry::with_defaults(), &args).await;
    store.close().await;
    let record = record?;

    match OutputFormat::from_json_flag(json) {
        OutputFormat::Json => output::json(&record)?,
        OutputFormat::Text => {
            output::success(&format!("Registered provider #{}", record.id));
            output::key_value("Model", &record.spec.wrapper_name);
            output::key_value("Upstream", &record.spec.describe());
        }
    }
    Ok(())
}

/// Execute the list-providers command
pub async fn execute_list(
    args: ListProvidersArgs,
    config_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = gateway_config::load_config(config_path).await?;
    let store = open_store(&config, args.database_url.as_deref()).await?;
    let records = list(&store, args.model.as_deref()).await;
    store.close().await;
    let records = records?;

    match OutputFormat::from_json_flag(json) {
        OutputFormat::Json => output::json(&json!({
            "count": records.len(),
            "providers": records,
        }))?,
        OutputFormat::Text => {
            if records.is_empty() {
                output::info("No active providers");
                return Ok(());
            }
            let rows: Vec<ProviderRow> = records.iter().map(ProviderRow::from).collect();
            output::table(&rows);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::MemoryStore;
    use gateway_providers::testing::{Script, ScriptedFactory};

    fn args(model: &str, type_name: &str) -> RegisterProviderArgs {
        RegisterProviderArgs {
            model: model.to_string(),
            upstream_model: None,
            type_name: type_name.to_string(),
            domain: "api.example.com".to_string(),
            api_key: "sk-up".to_string(),
            no_https: false,
            reasoning_budget: None,
            verify: false,
            verify_timeout_secs: 5,
            database_url: None,
        }
    }

    fn scripted(domain: &str, script: Script) -> (ClientRegistry, ScriptedFactory) {
        let factory = ScriptedFactory::new().with_script(domain, script);
        let registry = ClientRegistry::with_defaults();
        registry.register("scripted", factory.clone());
        (registry, factory)
    }

    fn verified_args(domain: &str) -> RegisterProviderArgs {
        let mut a = args("gpt-4o", "scripted");
        a.domain = domain.to_string();
        a.verify = true;
        a
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let store = MemoryStore::new();
        let registry = ClientRegistry::with_defaults();
        let first = register(&store, &registry, &args("gpt-4o", "openai")).await.unwrap();
        register(&store, &registry, &args("deepseek-chat", "deepseek")).await.unwrap();
        let again = register(&store, &registry, &args("gpt-4o", "openai")).await.unwrap();
        assert_eq!(first.id, again.id);

        let all = list(&store, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].spec.wrapper_name, "deepseek-chat");

        let filtered = list(&store, Some("gpt-4o")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].spec.model_name, "gpt-4o");
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_type() {
        let store = MemoryStore::new();
        let err = register(&store, &ClientRegistry::with_defaults(), &args("gpt-4o", "carrier-pigeon"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown provider type"));
        assert!(list(&store, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verified_provider_is_stored() {
        let store = MemoryStore::new();
        let (registry, factory) = scripted("up.example.com", Script::reply("Pong"));
        let record = register(&store, &registry, &verified_args("up.example.com"))
            .await
            .unwrap();
        assert_eq!(record.spec.type_name, "scripted");
        assert_eq!(factory.calls("up.example.com"), 1);
    }

    #[tokio::test]
    async fn test_failed_verification_stores_nothing() {
        let store = MemoryStore::new();
        let (registry, factory) = scripted("down.example.com", Script::refuse("invalid api key"));
        let err = register(&store, &registry, &verified_args("down.example.com"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed verification"), "{err:#}");
        assert_eq!(factory.calls("down.example.com"), 1);

        let (registry, _) = scripted("mute.example.com", Script::default());
        assert!(register(&store, &registry, &verified_args("mute.example.com"))
            .await
            .is_err());
        assert!(list(&store, None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_times_out() {
        let store = MemoryStore::new();
        let (registry, _) = scripted(
            "slow.example.com",
            Script::default().sleep(Duration::from_secs(60)).content("Pong"),
        );
        let err = register(&store, &registry, &verified_args("slow.example.com"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not answer"), "{err}");
    }

    #[test]
    fn test_spec_defaults_upstream_model() {
        let mut a = args("gpt-4o", "openai");
        assert_eq!(a.to_spec().model_name, "gpt-4o");
        a.upstream_model = Some("gpt-4o-2024-08-06".to_string());
        a.reasoning_budget = Some(1024);
        let spec = a.to_spec();
        assert_eq!(spec.model_name, "gpt-4o-2024-08-06");
        assert_eq!(spec.reasoning_budget, Some(1024));
    }

    #[test]
    fn test_row_for_unchecked_provider() {
        colored::control::set_override(false);
        let record = ProviderRecord {
            id: 7,
            spec: args("gpt-4o", "openai").to_spec(),
            counters: Default::default(),
        };
        let row = ProviderRow::from(&record);
        assert_eq!(row.health, "unchecked");
        assert_eq!(row.last_checked, "never");
    }
}
