//! # Gateway Server
//!
//! The balancer itself: a raw HTTP/1.1 listener serving one request per
//! connection.
//!
//! This crate provides:
//! - Chat completions with provider failover and chunked SSE streaming
//! - Embeddings over the same provider pools
//! - Model listing and the metrics endpoint
//! - Geocoding passthrough and web-search relay over rotating key pools
//! - Caller identity resolution and one-time-code verification
//! - Provider health checks and the adaptive latency watcher
//! - Graceful shutdown handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod balancer;
pub mod chat;
pub mod embeddings;
pub mod health;
pub mod http;
pub mod latency;
pub mod models;
pub mod proxy;
pub mod router;
pub mod shutdown;
pub mod state;
pub mod writer;

// Re-export main types
pub use auth::{CallerIdentity, OtpVerifier, TotpVerifier};
pub use balancer::{serve, Balancer, SHUTDOWN_GRACE};
pub use health::{HealthCheckConfig, HealthCheckManager, PoolKeyProbe, ProbeLedger};
pub use latency::{LatencyWatcher, LatencyWatcherConfig, TickReport};
pub use proxy::searchers::{SearchResult, Searcher, SearcherRegistry};
pub use router::RequestRouter;
pub use shutdown::{shutdown_signal, ShutdownCoordinator, ShutdownPhase};
pub use state::{
    AmapOptions, GatewayState, GatewayStateBuilder, ServerOptions, WebSearchOptions,
};
pub use writer::{ResponseMode, StreamChunkWriter};
