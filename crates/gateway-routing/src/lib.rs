//! # Gateway Routing
//!
//! Model registry and provider selection for the LLM Balance Gateway.
//!
//! This crate provides:
//! - [`Entrypoints`]: logical model name to provider pool
//! - Uniform random selection with an injectable random source
//! - Failover sequencing that never repeats a provider within a request
//! - [`KeyManager`]: caller key lookup

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entrypoint;
pub mod keys;
pub mod selector;

// Re-export main types
pub use entrypoint::{Entrypoints, ModelEntry};
pub use keys::KeyManager;
pub use selector::{ProviderSelector, RandomSelector, SeededSelector};
