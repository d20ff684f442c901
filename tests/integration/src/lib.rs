//! Integration tests for the LLM Balance Gateway
//!
//! Every test runs a real balancer on a loopback port against wiremock
//! upstreams:
//! - Request validation, routing and the model listing
//! - Chat streaming, buffering and provider failover
//! - Embeddings over the same provider pools
//! - Geocoding passthrough and the web-search relay

pub mod fixtures;
pub mod helpers;
pub mod mock_providers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_providers::*;

#[cfg(test)]
mod api_tests;
#[cfg(test)]
mod chat_tests;
#[cfg(test)]
mod proxy_tests;
