//! # Gateway Providers
//!
//! Upstream providers for the LLM Balance Gateway.
//!
//! This crate provides:
//! - [`Provider`]: one configured upstream with a lazily built, cached client
//! - [`ClientRegistry`]: type name to client factory lookup
//! - An OpenAI-compatible streaming client covering OpenAI, DeepSeek,
//!   Moonshot, SiliconFlow, OpenRouter, Tongyi, Volcengine and Ollama
//! - Scripted clients for tests (`testing` feature)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod openai;
pub mod provider;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use openai::{OpenAICompatibleClient, OpenAICompatibleFactory, OpenAIFlavor};
pub use provider::Provider;
pub use registry::ClientRegistry;
