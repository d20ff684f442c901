//! Domain types shared by every gateway crate.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Consecutive failures after which a provider or key is marked unhealthy
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Suffix marking models that may be used without an API key
pub const FREE_MODEL_SUFFIX: &str = "-free";

/// Pseudo key that free-model traffic is accounted to
pub const FREE_USER_KEY: &str = "free-user";

/// Returns true for models callable without a key
#[must_use]
pub fn is_free_model(model: &str) -> bool {
    model.ends_with(FREE_MODEL_SUFFIX)
}

/// Mask a secret for logs and listings (`sk-a...wxyz`)
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// A caller credential and the models it may use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// The bearer token
    pub key: String,
    /// Models this key is allowed to call
    #[serde(default)]
    pub allowed_models: HashSet<String>,
}

impl ApiKey {
    /// Create a key with the given allowed models
    pub fn new<I, S>(key: impl Into<String>, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            allowed_models: models.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the key may call `model`
    #[must_use]
    pub fn allows(&self, model: &str) -> bool {
        self.allowed_models.contains(model)
    }
}

/// Static description of one upstream endpoint/credential pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Logical model name exposed to callers
    pub wrapper_name: String,
    /// Model name sent upstream
    pub model_name: String,
    /// Client type, e.g. `openai`, `deepseek`
    pub type_name: String,
    /// Domain or full base URL of the upstream
    #[serde(default)]
    pub domain_or_url: String,
    /// Upstream credential
    #[serde(skip_serializing, default = "empty_secret")]
    pub api_key: SecretString,
    /// Use plain HTTP instead of HTTPS
    #[serde(default)]
    pub no_https: bool,
    /// Optional reasoning token budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

impl ProviderSpec {
    /// Create a spec with the mandatory fields
    pub fn new(
        wrapper_name: impl Into<String>,
        model_name: impl Into<String>,
        type_name: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            wrapper_name: wrapper_name.into(),
            model_name: model_name.into(),
            type_name: type_name.into(),
            domain_or_url: String::new(),
            api_key: SecretString::new(api_key.into()),
            no_https: false,
            reasoning_budget: None,
        }
    }

    /// Set the domain or base URL
    #[must_use]
    pub fn with_domain(mut self, domain_or_url: impl Into<String>) -> Self {
        self.domain_or_url = domain_or_url.into();
        self
    }

    /// Use plain HTTP
    #[must_use]
    pub fn with_no_https(mut self, no_https: bool) -> Self {
        self.no_https = no_https;
        self
    }

    /// Set the reasoning budget
    #[must_use]
    pub fn with_reasoning_budget(mut self, budget: u32) -> Self {
        self.reasoning_budget = Some(budget);
        self
    }

    /// Short description used in logs (never includes the secret)
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{}/{}@{}",
            self.type_name,
            self.model_name,
            if self.domain_or_url.is_empty() {
                "default"
            } else {
                &self.domain_or_url
            }
        )
    }

    /// Identity used to de-duplicate providers across stores
    #[must_use]
    pub fn identity(&self) -> (String, String, String, String, String) {
        (
            self.wrapper_name.clone(),
            self.model_name.clone(),
            self.type_name.clone(),
            self.domain_or_url.clone(),
            self.api_key.expose_secret().clone(),
        )
    }
}

/// Cumulative outcome counters with the consecutive-failure health rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounters {
    /// Total observations
    pub total_requests: u64,
    /// Successful observations
    pub success_count: u64,
    /// Failed observations
    pub failure_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Current health flag
    pub healthy: bool,
    /// Latency of the last observation in milliseconds
    pub last_latency_ms: i64,
    /// Outcome of the last observation
    pub last_request_ok: bool,
    /// Whether at least one health probe completed
    pub first_check_completed: bool,
    /// Time of the last health probe
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Error of the last failed health probe
    pub last_error: Option<String>,
}

impl Default for HealthCounters {
    fn default() -> Self {
        Self {
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            healthy: true,
            last_latency_ms: 0,
            last_request_ok: false,
            first_check_completed: false,
            last_checked_at: None,
            last_error: None,
        }
    }
}

impl HealthCounters {
    /// Record one request outcome
    pub fn record_outcome(&mut self, success: bool, latency_ms: i64) {
        self.total_requests += 1;
        self.last_latency_ms = latency_ms;
        self.last_request_ok = success;
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
            self.healthy = true;
        } else {
            self.failure_count += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= UNHEALTHY_THRESHOLD {
                self.healthy = false;
            }
        }
    }

    /// Record one health probe
    pub fn record_probe(&mut self, healthy: bool, latency_ms: i64, error: Option<String>) {
        self.record_outcome(healthy, latency_ms);
        self.first_check_completed = true;
        self.last_checked_at = Some(Utc::now());
        self.last_error = if healthy { None } else { error };
    }
}

/// A provider as persisted by the store
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRecord {
    /// Store identifier
    pub id: i64,
    /// Static description
    #[serde(flatten)]
    pub spec: ProviderSpec,
    /// Health and traffic counters
    #[serde(flatten)]
    pub counters: HealthCounters,
}

/// Kind of auxiliary key pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Geocoding keys
    Amap,
    /// Web-search keys, sub-typed by searcher
    WebSearch,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amap => write!(f, "amap"),
            Self::WebSearch => write!(f, "web_search"),
        }
    }
}

/// One key in an auxiliary pool
#[derive(Debug, Clone)]
pub struct PoolKey {
    /// Store identifier
    pub id: i64,
    /// Pool this key belongs to
    pub kind: PoolKind,
    /// Sub-type, e.g. `brave` for web search; empty for geocoding
    pub sub_type: String,
    /// Upstream credential
    pub api_key: SecretString,
    /// Optional upstream override
    pub base_url: Option<String>,
    /// Whether the key participates in failover
    pub active: bool,
    /// Health and traffic counters
    pub counters: HealthCounters,
}

impl PoolKey {
    /// Create an active key
    pub fn new(
        id: i64,
        kind: PoolKind,
        sub_type: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            sub_type: sub_type.into(),
            api_key: SecretString::new(api_key.into()),
            base_url: None,
            active: true,
            counters: HealthCounters::default(),
        }
    }

    /// Set an upstream override
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Masked key for logs
    #[must_use]
    pub fn masked(&self) -> String {
        mask_secret(self.api_key.expose_secret())
    }
}

/// Outcome of a single health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    /// Store identifier of the probed provider or key
    pub id: i64,
    /// Human readable subject
    pub subject: String,
    /// Probe verdict
    pub is_healthy: bool,
    /// Time to first byte in milliseconds; 0 when nothing arrived
    pub response_time_ms: i64,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sort results healthy first, then by ascending response time
pub fn order_best_first(results: &mut [HealthCheckResult]) {
    results.sort_by(|a, b| {
        b.is_healthy
            .cmp(&a.is_healthy)
            .then(a.response_time_ms.cmp(&b.response_time_ms))
    });
}
