//! Shared gateway state.
//!
//! [`GatewayState`] is built once at startup and handed to every connection
//! by reference. It owns the provider registry, caller keys, the store, the
//! two free-tier rate limiters and the proxy plumbing.

use crate::auth::{OtpVerifier, TotpVerifier};
use crate::health::ProbeLedger;
use crate::proxy::searchers::SearcherRegistry;
use gateway_config::{AmapSettings, GatewayConfig, ServerSettings, WebSearchSettings};
use gateway_core::{GatewayError, GatewayResult, PoolKey, PoolKind, ProviderStore};
use gateway_providers::{ClientRegistry, Provider};
use gateway_resilience::{RateLimitPolicy, RateLimiter, RateLimiterConfig};
use gateway_routing::{Entrypoints, KeyManager, ProviderSelector};
use gateway_telemetry::{Metrics, SharedMetrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection and upstream tuning
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Deadline for reading one request
    pub read_timeout: Duration,
    /// Bound on one upstream call, and on each wait for the next fragment
    pub upstream_timeout: Duration,
    /// Deadline for the free-tier rate-limit wait
    pub rate_limit_wait: Duration,
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            read_timeout: settings.read_timeout,
            upstream_timeout: settings.upstream_timeout,
            rate_limit_wait: settings.rate_limit_wait,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

/// Geocoding passthrough options
#[derive(Debug, Clone)]
pub struct AmapOptions {
    /// Upstream base URL used when a key has no override
    pub base_url: String,
    /// Whether trace-id callers are served
    pub allow_free_users: bool,
}

impl Default for AmapOptions {
    fn default() -> Self {
        Self::from(&AmapSettings::default())
    }
}

impl From<&AmapSettings> for AmapOptions {
    fn from(settings: &AmapSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            allow_free_users: settings.allow_free_users,
        }
    }
}

/// Web-search relay options
#[derive(Debug, Clone)]
pub struct WebSearchOptions {
    /// Whether trace-id callers are served
    pub allow_free_users: bool,
    /// Traffic charged per paid search
    pub traffic_per_search: u64,
}

impl Default for WebSearchOptions {
    fn default() -> Self {
        Self::from(&WebSearchSettings::default())
    }
}

impl From<&WebSearchSettings> for WebSearchOptions {
    fn from(settings: &WebSearchSettings) -> Self {
        Self {
            allow_free_users: settings.allow_free_users,
            traffic_per_search: settings.traffic_per_search,
        }
    }
}

/// Everything a request handler needs
pub struct GatewayState {
    store: Arc<dyn ProviderStore>,
    entrypoints: Entrypoints,
    keys: KeyManager,
    clients: ClientRegistry,
    metrics: SharedMetrics,
    options: ServerOptions,
    amap: AmapOptions,
    web_search: WebSearchOptions,
    geo_limiter: Arc<RateLimiter>,
    search_limiter: Arc<RateLimiter>,
    otp: Option<Arc<dyn OtpVerifier>>,
    searchers: SearcherRegistry,
    probes: ProbeLedger,
    http: reqwest::Client,
}

impl GatewayState {
    /// Seed the store from configuration and build the state
    ///
    /// Keys, providers and pool keys from the document are upserted, so
    /// restarting with the same file is idempotent. Every configured model
    /// gets an entry even without providers, which turns requests for it
    /// into "no provider" rather than "model not found".
    ///
    /// # Errors
    /// Returns storage errors and client construction failures
    pub async fn from_config(
        config: &GatewayConfig,
        store: Arc<dyn ProviderStore>,
        clients: ClientRegistry,
    ) -> GatewayResult<Self> {
        for (key, limit) in config.api_keys() {
            store.upsert_api_key(&key, limit).await?;
        }

        for spec in config.provider_specs() {
            if !clients.supports(&spec.type_name) {
                warn!(provider = %spec.describe(), "Unsupported provider type, requests will fail");
            }
            store.upsert_provider(&spec).await?;
        }

        let amap_keys = config
            .amap
            .keys
            .iter()
            .map(|k| (PoolKind::Amap, k));
        let search_keys = config
            .web_search
            .keys
            .iter()
            .map(|k| (PoolKind::WebSearch, k));
        for (kind, key) in amap_keys.chain(search_keys) {
            let mut pool_key = PoolKey::new(0, kind, key.sub_type.to_lowercase(), "");
            pool_key.api_key = key.api_key.clone();
            pool_key.base_url = key.base_url.clone();
            store.upsert_pool_key(&pool_key).await?;
        }

        let mut builder = GatewayStateBuilder::new(store)
            .with_clients(clients)
            .with_options(ServerOptions::from(&config.server))
            .with_amap(AmapOptions::from(&config.amap))
            .with_web_search(WebSearchOptions::from(&config.web_search));
        if let Some(secret) = &config.web_search.otp_secret {
            builder = builder.with_otp(Arc::new(TotpVerifier::new(secret.clone())));
        }
        let state = builder.build()?;

        for model in &config.models {
            state.entrypoints.create_model_entry(&model.name);
        }
        let providers = state.reload_providers().await?;
        let keys = state.reload_keys().await?;
        info!(
            models = state.entrypoints.model_names().len(),
            providers,
            keys,
            "Gateway state loaded"
        );
        Ok(state)
    }

    /// Repository
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ProviderStore> {
        &self.store
    }

    /// Model registry
    #[must_use]
    pub fn entrypoints(&self) -> &Entrypoints {
        &self.entrypoints
    }

    /// Caller keys
    #[must_use]
    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Client factories
    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Metrics registry
    #[must_use]
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Connection tuning
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Geocoding options
    #[must_use]
    pub fn amap(&self) -> &AmapOptions {
        &self.amap
    }

    /// Web-search options
    #[must_use]
    pub fn web_search(&self) -> &WebSearchOptions {
        &self.web_search
    }

    /// Rate limiter for free geocoding callers
    #[must_use]
    pub fn geo_limiter(&self) -> &Arc<RateLimiter> {
        &self.geo_limiter
    }

    /// Rate limiter for free web-search callers
    #[must_use]
    pub fn search_limiter(&self) -> &Arc<RateLimiter> {
        &self.search_limiter
    }

    /// One-time-code verifier, when configured
    #[must_use]
    pub fn otp(&self) -> Option<&dyn OtpVerifier> {
        self.otp.as_deref()
    }

    /// Web-search backends
    #[must_use]
    pub fn searchers(&self) -> &SearcherRegistry {
        &self.searchers
    }

    /// HTTP client for the auxiliary proxies
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// When each provider was last probed, by either health loop
    #[must_use]
    pub fn probes(&self) -> &ProbeLedger {
        &self.probes
    }

    /// Add active providers from the store to the registry
    ///
    /// Providers already registered under the same id are kept, so their
    /// cached clients survive. Returns the number of active providers.
    ///
    /// # Errors
    /// Returns storage errors
    pub async fn reload_providers(&self) -> GatewayResult<usize> {
        let records = self.store.active_providers().await?;
        let count = records.len();
        for record in records {
            self.entrypoints
                .add_provider(Arc::new(Provider::new(record.id, record.spec)));
        }
        debug!(providers = count, "Providers reloaded from store");
        Ok(count)
    }

    /// Merge caller keys from the store
    ///
    /// # Errors
    /// Returns storage errors
    pub async fn reload_keys(&self) -> GatewayResult<usize> {
        let keys = self.store.api_keys().await?;
        let count = keys.len();
        self.keys.extend(keys);
        Ok(count)
    }

    /// Record a provider outcome without blocking the response
    pub fn spawn_provider_stats(&self, id: i64, success: bool, latency_ms: i64) {
        if id == 0 {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_provider_stats(id, success, latency_ms).await {
                warn!(provider_id = id, error = %e, "Failed to record provider stats");
            }
        });
    }

    /// Account caller traffic without blocking the response
    pub fn spawn_key_traffic(&self, account: &str, input_bytes: u64, output_bytes: u64, success: bool) {
        let store = self.store.clone();
        let account = account.to_string();
        tokio::spawn(async move {
            if let Err(e) = store
                .record_key_traffic(&account, input_bytes, output_bytes, success)
                .await
            {
                warn!(key = %gateway_core::mask_secret(&account), error = %e, "Failed to record key traffic");
            }
        });
    }

    /// Record a pool key outcome without blocking the response
    pub fn spawn_pool_key_stats(&self, id: i64, success: bool, latency_ms: i64) {
        if id == 0 {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_pool_key_stats(id, success, latency_ms).await {
                warn!(pool_key_id = id, error = %e, "Failed to record pool key stats");
            }
        });
    }
}

/// Builder for [`GatewayState`]
pub struct GatewayStateBuilder {
    store: Arc<dyn ProviderStore>,
    clients: Option<ClientRegistry>,
    selector: Option<Arc<dyn ProviderSelector>>,
    metrics: Option<SharedMetrics>,
    options: ServerOptions,
    amap: AmapOptions,
    web_search: WebSearchOptions,
    geo_limiter: RateLimiterConfig,
    search_limiter: RateLimiterConfig,
    otp: Option<Arc<dyn OtpVerifier>>,
    searchers: Option<SearcherRegistry>,
}

impl GatewayStateBuilder {
    /// Start from a store; everything else has defaults
    #[must_use]
    pub fn new(store: Arc<dyn ProviderStore>) -> Self {
        Self {
            store,
            clients: None,
            selector: None,
            metrics: None,
            options: ServerOptions::default(),
            amap: AmapOptions::default(),
            web_search: WebSearchOptions::default(),
            geo_limiter: RateLimiterConfig::new(RateLimitPolicy::simple()),
            search_limiter: RateLimiterConfig::new(RateLimitPolicy::cooldown()),
            otp: None,
            searchers: None,
        }
    }

    /// Client factories; defaults to the built-in OpenAI-compatible set
    #[must_use]
    pub fn with_clients(mut self, clients: ClientRegistry) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Random source for provider selection
    #[must_use]
    pub fn with_selector(mut self, selector: Arc<dyn ProviderSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Share a metrics registry
    #[must_use]
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Connection tuning
    #[must_use]
    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Geocoding options
    #[must_use]
    pub fn with_amap(mut self, amap: AmapOptions) -> Self {
        self.amap = amap;
        self
    }

    /// Web-search options
    #[must_use]
    pub fn with_web_search(mut self, web_search: WebSearchOptions) -> Self {
        self.web_search = web_search;
        self
    }

    /// Rate limiter settings for the geocoding and web-search routes
    #[must_use]
    pub fn with_rate_limiters(mut self, geo: RateLimiterConfig, search: RateLimiterConfig) -> Self {
        self.geo_limiter = geo;
        self.search_limiter = search;
        self
    }

    /// Require one-time codes on the web-search route
    #[must_use]
    pub fn with_otp(mut self, verifier: Arc<dyn OtpVerifier>) -> Self {
        self.otp = Some(verifier);
        self
    }

    /// Web-search backends; defaults to every built-in searcher
    #[must_use]
    pub fn with_searchers(mut self, searchers: SearcherRegistry) -> Self {
        self.searchers = Some(searchers);
        self
    }

    /// Build the state
    ///
    /// # Errors
    /// Returns an internal error when metrics or the HTTP client cannot be
    /// created
    pub fn build(self) -> GatewayResult<GatewayState> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                Metrics::new().map_err(|e| GatewayError::internal(format!("metrics: {e}")))?,
            ),
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(self.options.upstream_timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("http client: {e}")))?;
        let entrypoints = match self.selector {
            Some(selector) => Entrypoints::with_selector(selector),
            None => Entrypoints::new(),
        };

        Ok(GatewayState {
            store: self.store,
            entrypoints,
            keys: KeyManager::new(),
            clients: self.clients.unwrap_or_else(ClientRegistry::with_defaults),
            metrics,
            options: self.options,
            amap: self.amap,
            web_search: self.web_search,
            geo_limiter: Arc::new(RateLimiter::new("amap", self.geo_limiter)),
            search_limiter: Arc::new(RateLimiter::new("web_search", self.search_limiter)),
            otp: self.otp,
            searchers: self.searchers.unwrap_or_else(SearcherRegistry::with_defaults),
            probes: ProbeLedger::default(),
            http,
        })
    }
}
