//! Prometheus metrics.
//!
//! Each [`Metrics`] owns its own [`Registry`], so several balancers (tests
//! run many) never collide on metric names.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

const FIRST_BYTE_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0, 60.0];

/// Metrics error
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Registration failed
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),
    /// Encoding failed
    #[error("failed to encode metrics: {0}")]
    Encode(String),
}

/// Balancer metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    active_connections: IntGauge,
    active_chat_requests: IntGauge,
    requests_total: IntCounterVec,
    provider_attempts: IntCounterVec,
    first_byte: HistogramVec,
}

impl Metrics {
    /// Create and register every metric
    ///
    /// # Errors
    /// Returns error if a metric cannot be registered
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let active_connections = IntGauge::with_opts(Opts::new(
            "balancer_active_connections",
            "Client connections currently open",
        ))?;
        let active_chat_requests = IntGauge::with_opts(Opts::new(
            "balancer_active_chat_requests",
            "Chat completion requests currently in flight",
        ))?;
        let requests_total = IntCounterVec::new(
            Opts::new("balancer_requests_total", "Requests handled by route and status"),
            &["route", "status"],
        )?;
        let provider_attempts = IntCounterVec::new(
            Opts::new(
                "balancer_provider_attempts_total",
                "Upstream provider attempts by model and outcome",
            ),
            &["model", "outcome"],
        )?;
        let first_byte = HistogramVec::new(
            HistogramOpts::new(
                "balancer_upstream_first_byte_seconds",
                "Time until the first upstream fragment",
            )
            .buckets(FIRST_BYTE_BUCKETS.to_vec()),
            &["model"],
        )?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(active_chat_requests.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(provider_attempts.clone()))?;
        registry.register(Box::new(first_byte.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            active_chat_requests,
            requests_total,
            provider_attempts,
            first_byte,
        })
    }

    /// Track one open connection until the guard drops
    #[must_use]
    pub fn connection(&self) -> ConcurrencyGuard {
        ConcurrencyGuard::new(self.active_connections.clone())
    }

    /// Track one in-flight chat request until the guard drops
    #[must_use]
    pub fn chat_request(&self) -> ConcurrencyGuard {
        ConcurrencyGuard::new(self.active_chat_requests.clone())
    }

    /// Chat requests currently in flight
    #[must_use]
    pub fn active_chat_requests(&self) -> i64 {
        self.active_chat_requests.get()
    }

    /// Open connections
    #[must_use]
    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    /// Count a finished request
    pub fn record_request(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    /// Count one provider attempt; `outcome` is `success` or `failure`
    pub fn record_attempt(&self, model: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.provider_attempts
            .with_label_values(&[model, outcome])
            .inc();
    }

    /// Attempts recorded for a model and outcome
    #[must_use]
    pub fn attempts(&self, model: &str, success: bool) -> u64 {
        let outcome = if success { "success" } else { "failure" };
        self.provider_attempts
            .with_label_values(&[model, outcome])
            .get()
    }

    /// Observe time to first upstream fragment
    pub fn observe_first_byte(&self, model: &str, elapsed: Duration) {
        self.first_byte
            .with_label_values(&[model])
            .observe(elapsed.as_secs_f64());
    }

    /// Render in the Prometheus text format
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn gather(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }

    /// Content type of [`Metrics::gather`] output
    #[must_use]
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

/// Increments a gauge on creation and decrements it on drop
#[derive(Debug)]
pub struct ConcurrencyGuard {
    gauge: IntGauge,
}

impl ConcurrencyGuard {
    fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Shared handle
pub type SharedMetrics = Arc<Metrics>;
