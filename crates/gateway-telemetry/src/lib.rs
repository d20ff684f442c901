//! # Gateway Telemetry
//!
//! Observability for the balance gateway:
//! - Structured logging through `tracing-subscriber`
//! - Prometheus metrics for connections, requests and upstream attempts

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LoggingConfig, LoggingError};
pub use metrics::{ConcurrencyGuard, Metrics, MetricsError, SharedMetrics};
