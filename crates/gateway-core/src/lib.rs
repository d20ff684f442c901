//! # Gateway Core
//!
//! Core types, traits, and error handling for the LLM Balance Gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Chat request parsing and prompt flattening
//! - Embedding request and response types
//! - Streamed chunk wire types
//! - The upstream AI client capability
//! - The persistence contract and an in-memory store
//! - Error types and HTTP status mapping

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod embedding;
pub mod error;
pub mod request;
pub mod store;
pub mod streaming;
pub mod types;

// Re-export commonly used types
pub use client::{AiClient, ClientFactory, ClientOptions, DeltaStream, StreamDelta, PING_PROMPT};
pub use embedding::{
    EmbeddingData, EmbeddingInput, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage,
};
pub use error::{GatewayError, GatewayResult};
pub use request::{ChatCompletionRequest, ChatMessage, MessageContent, Prompt};
pub use store::{KeyTraffic, MemoryStore, ProviderStore};
pub use streaming::{ChatChunk, ChatCompletion, ChunkChoice, ChunkDelta, DeltaKind};
pub use types::{
    is_free_model, mask_secret, order_best_first, ApiKey, HealthCheckResult, HealthCounters,
    PoolKey, PoolKind, ProviderRecord, ProviderSpec, FREE_MODEL_SUFFIX, FREE_USER_KEY,
    UNHEALTHY_THRESHOLD,
};
