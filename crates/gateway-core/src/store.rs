//! Repository contract between the balancer and its persistence layer.
//!
//! The core never dictates a storage engine. It reads active providers and
//! key pools and reports outcomes; implementations only have to be
//! eventually consistent. [`MemoryStore`] backs tests and config-only
//! deployments.

use crate::error::{GatewayError, GatewayResult};
use crate::types::{ApiKey, HealthCounters, PoolKey, PoolKind, ProviderRecord, ProviderSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::collections::{BTreeMap, HashMap};

/// Persistence operations the balancer depends on
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// All providers that should be served
    async fn active_providers(&self) -> GatewayResult<Vec<ProviderRecord>>;

    /// Insert a provider or return the existing record with the same identity
    async fn upsert_provider(&self, spec: &ProviderSpec) -> GatewayResult<ProviderRecord>;

    /// Look up one provider
    async fn provider(&self, id: i64) -> GatewayResult<Option<ProviderRecord>>;

    /// Record a request outcome against a provider
    async fn update_provider_stats(&self, id: i64, success: bool, latency_ms: i64)
        -> GatewayResult<()>;

    /// Record a health probe against a provider
    async fn update_provider_health(
        &self,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> GatewayResult<()>;

    /// Caller keys known to the store
    async fn api_keys(&self) -> GatewayResult<Vec<ApiKey>>;

    /// Insert a caller key or replace its allowed models and quota
    async fn upsert_api_key(&self, key: &ApiKey, limit: Option<u64>) -> GatewayResult<()>;

    /// Account traffic for a caller key
    async fn record_key_traffic(
        &self,
        key: &str,
        input_bytes: u64,
        output_bytes: u64,
        success: bool,
    ) -> GatewayResult<()>;

    /// Whether the key still has traffic quota
    async fn traffic_allowed(&self, key: &str) -> GatewayResult<bool>;

    /// Active keys of a pool, optionally restricted to one sub-type
    async fn active_pool_keys(
        &self,
        kind: PoolKind,
        sub_type: Option<&str>,
    ) -> GatewayResult<Vec<PoolKey>>;

    /// Number of active keys per sub-type
    async fn pool_key_counts(&self, kind: PoolKind) -> GatewayResult<Vec<(String, usize)>>;

    /// Insert a pool key unless one with the same kind, sub-type and secret
    /// exists; returns the store id
    async fn upsert_pool_key(&self, key: &PoolKey) -> GatewayResult<i64>;

    /// Record a request outcome against a pool key
    async fn update_pool_key_stats(&self, id: i64, success: bool, latency_ms: i64)
        -> GatewayResult<()>;

    /// Record a health probe against a pool key
    async fn update_pool_key_health(
        &self,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> GatewayResult<()>;
}

/// Traffic accounting for one caller key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTraffic {
    /// Bytes received from the caller
    pub input_bytes: u64,
    /// Bytes sent to the caller
    pub output_bytes: u64,
    /// Successful requests
    pub success_count: u64,
    /// Failed requests
    pub failure_count: u64,
    /// Quota in bytes; `None` means unlimited
    pub limit: Option<u64>,
}

impl KeyTraffic {
    /// Bytes counted against the quota
    #[must_use]
    pub fn used(&self) -> u64 {
        self.input_bytes + self.output_bytes
    }
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    providers: BTreeMap<i64, ProviderRecord>,
    keys: BTreeMap<String, (ApiKey, KeyTraffic)>,
    pool_keys: BTreeMap<i64, PoolKey>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller key with an optional byte quota
    pub fn add_api_key(&self, key: ApiKey, limit: Option<u64>) {
        let traffic = KeyTraffic {
            limit,
            ..KeyTraffic::default()
        };
        self.state.lock().keys.insert(key.key.clone(), (key, traffic));
    }

    /// Register a pool key; a zero id is replaced by a fresh one
    pub fn add_pool_key(&self, mut key: PoolKey) -> i64 {
        let mut state = self.state.lock();
        if key.id == 0 {
            state.next_id += 1;
            key.id = state.next_id;
        } else {
            state.next_id = state.next_id.max(key.id);
        }
        let id = key.id;
        state.pool_keys.insert(id, key);
        id
    }

    /// Traffic recorded for a key
    #[must_use]
    pub fn key_traffic(&self, key: &str) -> Option<KeyTraffic> {
        self.state.lock().keys.get(key).map(|(_, t)| t.clone())
    }

    /// Counters of a pool key
    #[must_use]
    pub fn pool_key(&self, id: i64) -> Option<PoolKey> {
        self.state.lock().pool_keys.get(&id).cloned()
    }
}

fn missing(what: &str, id: i64) -> GatewayError {
    GatewayError::storage(format!("{what} {id} not found"))
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn active_providers(&self) -> GatewayResult<Vec<ProviderRecord>> {
        Ok(self.state.lock().providers.values().cloned().collect())
    }

    async fn upsert_provider(&self, spec: &ProviderSpec) -> GatewayResult<ProviderRecord> {
        let mut state = self.state.lock();
        let identity = spec.identity();
        if let Some(existing) = state
            .providers
            .values()
            .find(|record| record.spec.identity() == identity)
        {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let record = ProviderRecord {
            id: state.next_id,
            spec: spec.clone(),
            counters: HealthCounters::default(),
        };
        state.providers.insert(record.id, record.clone());
        Ok(record)
    }

    async fn provider(&self, id: i64) -> GatewayResult<Option<ProviderRecord>> {
        Ok(self.state.lock().providers.get(&id).cloned())
    }

    async fn update_provider_stats(
        &self,
        id: i64,
        success: bool,
        latency_ms: i64,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let record = state.providers.get_mut(&id).ok_or_else(|| missing("provider", id))?;
        record.counters.record_outcome(success, latency_ms);
        Ok(())
    }

    async fn update_provider_health(
        &self,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let record = state.providers.get_mut(&id).ok_or_else(|| missing("provider", id))?;
        record
            .counters
            .record_probe(healthy, latency_ms, error.map(str::to_string));
        Ok(())
    }

    async fn api_keys(&self) -> GatewayResult<Vec<ApiKey>> {
        Ok(self.state.lock().keys.values().map(|(k, _)| k.clone()).collect())
    }

    async fn upsert_api_key(&self, key: &ApiKey, limit: Option<u64>) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .keys
            .entry(key.key.clone())
            .or_insert_with(|| (key.clone(), KeyTraffic::default()));
        entry.0 = key.clone();
        entry.1.limit = limit;
        Ok(())
    }

    async fn record_key_traffic(
        &self,
        key: &str,
        input_bytes: u64,
        output_bytes: u64,
        success: bool,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let (_, traffic) = state
            .keys
            .entry(key.to_string())
            .or_insert_with(|| (ApiKey::new(key, Vec::<String>::new()), KeyTraffic::default()));
        traffic.input_bytes += input_bytes;
        traffic.output_bytes += output_bytes;
        if success {
            traffic.success_count += 1;
        } else {
            traffic.failure_count += 1;
        }
        Ok(())
    }

    async fn traffic_allowed(&self, key: &str) -> GatewayResult<bool> {
        let state = self.state.lock();
        Ok(state.keys.get(key).map_or(true, |(_, traffic)| {
            traffic.limit.map_or(true, |limit| traffic.used() < limit)
        }))
    }

    async fn active_pool_keys(
        &self,
        kind: PoolKind,
        sub_type: Option<&str>,
    ) -> GatewayResult<Vec<PoolKey>> {
        let state = self.state.lock();
        Ok(state
            .pool_keys
            .values()
            .filter(|k| k.kind == kind && k.active)
            .filter(|k| sub_type.map_or(true, |s| k.sub_type == s))
            .filter(|k| !k.api_key.expose_secret().is_empty())
            .cloned()
            .collect())
    }

    async fn pool_key_counts(&self, kind: PoolKind) -> GatewayResult<Vec<(String, usize)>> {
        let state = self.state.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in state.pool_keys.values().filter(|k| k.kind == kind && k.active) {
            *counts.entry(key.sub_type.clone()).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort();
        Ok(counts)
    }

    async fn upsert_pool_key(&self, key: &PoolKey) -> GatewayResult<i64> {
        let existing = self.state.lock().pool_keys.values().find_map(|k| {
            (k.kind == key.kind
                && k.sub_type == key.sub_type
                && k.api_key.expose_secret() == key.api_key.expose_secret())
            .then_some(k.id)
        });
        match existing {
            Some(id) => Ok(id),
            None => Ok(self.add_pool_key(key.clone())),
        }
    }

    async fn update_pool_key_stats(
        &self,
        id: i64,
        success: bool,
        latency_ms: i64,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let key = state.pool_keys.get_mut(&id).ok_or_else(|| missing("pool key", id))?;
        key.counters.record_outcome(success, latency_ms);
        Ok(())
    }

    async fn update_pool_key_health(
        &self,
        id: i64,
        healthy: bool,
        latency_ms: i64,
        error: Option<&str>,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let key = state.pool_keys.get_mut(&id).ok_or_else(|| missing("pool key", id))?;
        key.counters
            .record_probe(healthy, latency_ms, error.map(str::to_string));
        Ok(())
    }
}
