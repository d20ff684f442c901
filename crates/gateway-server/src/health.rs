//! Provider and key-pool health checks.
//!
//! A provider is probed with a short ping prompt and judged on time to first
//! byte: healthy iff something arrived within the probe timeout and sooner
//! than the healthy-latency bound. Probes run concurrently behind a
//! semaphore; each runs on its own task so a panicking client only fails its
//! own result. Verdicts are persisted through the [`ProviderStore`] and kept
//! best-first for consumers that want to bias selection.
//!
//! [`ProviderStore`]: gateway_core::ProviderStore

use crate::proxy::amap::{call_upstream, upstream_url};
use crate::proxy::searchers::SearchQuery;
use crate::shutdown::{shutdown_requested, ShutdownPhase};
use crate::state::GatewayState;
use async_trait::async_trait;
use futures::StreamExt;
use gateway_config::HealthSettings;
use gateway_core::{
    order_best_first, GatewayError, GatewayResult, HealthCheckResult, PoolKey, PoolKind, Prompt,
    PING_PROMPT,
};
use gateway_providers::Provider;
use parking_lot::{Mutex, RwLock};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Slack subtracted from the interval when judging freshness; absorbs the
/// jitter between the health checker's and the watcher's ticks
pub const FRESHNESS_SLACK: Duration = Duration::from_secs(1);

/// Last probe time per provider, shared by every loop that probes
#[derive(Debug, Default)]
pub struct ProbeLedger {
    last_probed: Mutex<HashMap<i64, Instant>>,
}

impl ProbeLedger {
    /// Mark providers as probed now
    pub fn stamp(&self, ids: impl IntoIterator<Item = i64>) {
        let now = Instant::now();
        let mut last_probed = self.last_probed.lock();
        for id in ids {
            last_probed.insert(id, now);
        }
    }

    /// Whether a provider was probed less than `interval` ago
    #[must_use]
    pub fn is_fresh(&self, id: i64, interval: Duration) -> bool {
        self.last_probed
            .lock()
            .get(&id)
            .is_some_and(|at| at.elapsed() + FRESHNESS_SLACK < interval)
    }
}

/// Health check tuning
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Full sweep interval; also how long a verdict stays fresh
    pub interval: Duration,
    /// Time allowed for the first byte
    pub probe_timeout: Duration,
    /// First-byte latency below which a provider is healthy
    pub healthy_latency: Duration,
    /// Probes in flight at once
    pub concurrency: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(15),
            healthy_latency: Duration::from_secs(3),
            concurrency: 5,
        }
    }
}

impl From<&HealthSettings> for HealthCheckConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            interval: settings.interval,
            probe_timeout: settings.probe_timeout,
            healthy_latency: settings.healthy_latency,
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Probe one provider and return its verdict; never fails
pub async fn probe_provider(
    state: &GatewayState,
    provider: &Provider,
    config: &HealthCheckConfig,
) -> HealthCheckResult {
    let started = Instant::now();
    let first_byte = async {
        let client = provider.client(state.clients(), config.probe_timeout)?;
        let mut stream = client.chat_stream(&Prompt::text(PING_PROMPT)).await?;
        match stream.next().await {
            Some(Ok(_)) => Ok(started.elapsed()),
            Some(Err(e)) => Err(e),
            None => Err(GatewayError::provider(
                provider.describe(),
                "no data received",
                None,
                true,
            )),
        }
    };

    let (is_healthy, response_time_ms, error) = match timeout(config.probe_timeout, first_byte).await
    {
        Ok(Ok(elapsed)) => {
            let ms = elapsed.as_millis() as i64;
            if elapsed > Duration::ZERO && elapsed < config.healthy_latency {
                (true, ms, None)
            } else {
                (false, ms, Some(format!("first byte after {ms}ms")))
            }
        }
        Ok(Err(e)) => (false, 0, Some(e.to_string())),
        Err(_) => (
            false,
            0,
            Some(format!("no data within {}s", config.probe_timeout.as_secs())),
        ),
    };

    HealthCheckResult {
        id: provider.id(),
        subject: provider.describe(),
        is_healthy,
        response_time_ms,
        error,
    }
}

async fn persist_provider(state: &GatewayState, result: &HealthCheckResult) {
    if result.id == 0 {
        return;
    }
    if let Err(e) = state
        .store()
        .update_provider_health(
            result.id,
            result.is_healthy,
            result.response_time_ms,
            result.error.as_deref(),
        )
        .await
    {
        warn!(provider = %result.subject, error = %e, "Failed to persist health result");
    }
}

/// Probe providers concurrently, persist every verdict, return them best-first
///
/// Every provider is stamped in the state's [`ProbeLedger`] first.
pub async fn probe_providers(
    state: &Arc<GatewayState>,
    config: &HealthCheckConfig,
    providers: Vec<Arc<Provider>>,
) -> Vec<HealthCheckResult> {
    state.probes().stamp(providers.iter().map(|p| p.id()));
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut probes = JoinSet::new();

    for provider in providers {
        let state = state.clone();
        let config = config.clone();
        let semaphore = semaphore.clone();
        probes.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let id = provider.id();
            let subject = provider.describe();
            let probe = {
                let state = state.clone();
                tokio::spawn(async move { probe_provider(&state, &provider, &config).await })
            };
            let result = match probe.await {
                Ok(result) => result,
                Err(e) => HealthCheckResult {
                    id,
                    subject,
                    is_healthy: false,
                    response_time_ms: 0,
                    error: Some(format!("probe aborted: {e}")),
                },
            };
            persist_provider(&state, &result).await;
            result
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "Health probe task failed"),
        }
    }
    order_best_first(&mut results);
    results
}

/// Health probe for one kind of pool key
#[async_trait]
pub trait PoolKeyProbe: Send + Sync {
    /// Pool probed
    fn kind(&self) -> PoolKind;

    /// Check one key; `Ok` means usable
    async fn probe(&self, state: &GatewayState, key: &PoolKey) -> GatewayResult<()>;
}

/// Geocoding keys: an IP lookup must not report a key error
pub struct AmapKeyProbe;

#[async_trait]
impl PoolKeyProbe for AmapKeyProbe {
    fn kind(&self) -> PoolKind {
        PoolKind::Amap
    }

    async fn probe(&self, state: &GatewayState, key: &PoolKey) -> GatewayResult<()> {
        let base = key.base_url.as_deref().unwrap_or(&state.amap().base_url);
        let url = upstream_url(base, "v3/ip", None, key.api_key.expose_secret())?;
        let reply = call_upstream(state.http(), url).await?;
        if reply.status >= 400 {
            return Err(GatewayError::provider(
                "amap",
                format!("status {}", reply.status),
                Some(reply.status),
                true,
            ));
        }
        Ok(())
    }
}

/// Search keys: a one-result query must succeed
pub struct SearchKeyProbe;

#[async_trait]
impl PoolKeyProbe for SearchKeyProbe {
    fn kind(&self) -> PoolKind {
        PoolKind::WebSearch
    }

    async fn probe(&self, state: &GatewayState, key: &PoolKey) -> GatewayResult<()> {
        let searcher = state.searchers().get(&key.sub_type).ok_or_else(|| {
            GatewayError::unavailable(format!("searcher {} is not available", key.sub_type))
        })?;
        let query = SearchQuery {
            query: "ping".to_string(),
            page: 1,
            page_size: 1,
        };
        searcher.search(state.http(), key, &query).await.map(|_| ())
    }
}

/// Periodic health checker for providers and key pools
pub struct HealthCheckManager {
    state: Arc<GatewayState>,
    config: HealthCheckConfig,
    results: RwLock<Vec<HealthCheckResult>>,
    pool_probes: Vec<Arc<dyn PoolKeyProbe>>,
}

impl HealthCheckManager {
    /// Create a manager probing providers, geocoding keys and search keys
    #[must_use]
    pub fn new(state: Arc<GatewayState>, config: HealthCheckConfig) -> Self {
        Self {
            state,
            config,
            results: RwLock::new(Vec::new()),
            pool_probes: vec![Arc::new(AmapKeyProbe), Arc::new(SearchKeyProbe)],
        }
    }

    /// Replace the key-pool probes
    #[must_use]
    pub fn with_pool_probes(mut self, probes: Vec<Arc<dyn PoolKeyProbe>>) -> Self {
        self.pool_probes = probes;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Latest sweep results, best first
    #[must_use]
    pub fn last_results(&self) -> Vec<HealthCheckResult> {
        self.results.read().clone()
    }

    /// Whether a provider went unprobed for an interval
    ///
    /// Probes made by the latency watcher count too.
    #[must_use]
    pub fn should_check(&self, id: i64) -> bool {
        !self.state.probes().is_fresh(id, self.config.interval)
    }

    /// Probe every registered provider, or only the stale ones
    pub async fn check_all(&self, force: bool) -> Vec<HealthCheckResult> {
        let providers: Vec<Arc<Provider>> = self
            .state
            .entrypoints()
            .all_providers()
            .into_iter()
            .filter(|p| force || self.should_check(p.id()))
            .collect();
        if providers.is_empty() {
            debug!("No providers due for a health check");
            return Vec::new();
        }

        let results = probe_providers(&self.state, &self.config, providers).await;
        let healthy = results.iter().filter(|r| r.is_healthy).count();
        info!(checked = results.len(), healthy, "Provider health sweep finished");
        for result in results.iter().filter(|r| !r.is_healthy) {
            debug!(
                provider = %result.subject,
                error = result.error.as_deref().unwrap_or(""),
                "Provider unhealthy"
            );
        }
        *self.results.write() = results.clone();
        results
    }

    /// Probe every active key of every registered pool
    pub async fn check_pool_keys(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::new();
        for probe in &self.pool_probes {
            let kind = probe.kind();
            let keys = match self.state.store().active_pool_keys(kind, None).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(pool = %kind, error = %e, "Failed to load pool keys");
                    continue;
                }
            };

            let checked: Vec<HealthCheckResult> = futures::stream::iter(keys)
                .map(|key| {
                    let probe = probe.clone();
                    async move { self.probe_pool_key(probe.as_ref(), &key).await }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
            let healthy = checked.iter().filter(|r| r.is_healthy).count();
            info!(pool = %kind, checked = checked.len(), healthy, "Key pool health sweep finished");
            results.extend(checked);
        }
        order_best_first(&mut results);
        results
    }

    async fn probe_pool_key(&self, probe: &dyn PoolKeyProbe, key: &PoolKey) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = match timeout(self.config.probe_timeout, probe.probe(&self.state, key)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::timeout(
                format!("{} key", key.kind),
                self.config.probe_timeout,
            )),
        };
        let response_time_ms = started.elapsed().as_millis() as i64;
        let result = HealthCheckResult {
            id: key.id,
            subject: format!("{} {}", key.kind, key.masked()),
            is_healthy: outcome.is_ok(),
            response_time_ms,
            error: outcome.err().map(|e| e.to_string()),
        };

        if key.id != 0 {
            if let Err(e) = self
                .state
                .store()
                .update_pool_key_health(
                    key.id,
                    result.is_healthy,
                    response_time_ms,
                    result.error.as_deref(),
                )
                .await
            {
                warn!(key = %result.subject, error = %e, "Failed to persist key health");
            }
        }
        result
    }

    /// Run sweeps at the configured interval until shutdown
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<ShutdownPhase>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval.as_secs(),
                "Health checker started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_all(false).await;
                        self.check_pool_keys().await;
                    }
                    () = shutdown_requested(&mut shutdown) => break,
                }
            }
            info!("Health checker stopped");
        })
    }
}
