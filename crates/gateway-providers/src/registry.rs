//! Client registry: upstream type name to client factory.

use crate::openai::{OpenAICompatibleFactory, OpenAIFlavor};
use dashmap::DashMap;
use gateway_core::{AiClient, ClientFactory, ClientOptions, GatewayError, GatewayResult};
use std::sync::Arc;

/// Maps type names (`openai`, `deepseek`, ...) to client factories
#[derive(Default)]
pub struct ClientRegistry {
    factories: DashMap<String, Arc<dyn ClientFactory>>,
}

impl ClientRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in OpenAI-compatible flavor
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for flavor in OpenAIFlavor::builtin() {
            let name = flavor.type_name.to_string();
            registry.register(name, OpenAICompatibleFactory::new(flavor));
        }
        registry
    }

    /// Register or replace a factory
    pub fn register(&self, type_name: impl Into<String>, factory: impl ClientFactory + 'static) {
        self.factories
            .insert(type_name.into().to_lowercase(), Arc::new(factory));
    }

    /// Whether a type is known
    #[must_use]
    pub fn supports(&self, type_name: &str) -> bool {
        self.factories.contains_key(&type_name.to_lowercase())
    }

    /// Registered type names, sorted
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Build a client of the given type
    ///
    /// # Errors
    /// Returns a client-construction error for unknown types or factory
    /// failures
    pub fn build(
        &self,
        type_name: &str,
        options: &ClientOptions,
    ) -> GatewayResult<Arc<dyn AiClient>> {
        let factory = self
            .factories
            .get(&type_name.to_lowercase())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                GatewayError::client_construction(
                    type_name,
                    format!("unsupported client type '{type_name}'"),
                )
            })?;
        factory.build(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::time::Duration;

    fn options() -> ClientOptions {
        ClientOptions {
            model: "deepseek-chat".into(),
            domain_or_url: String::new(),
            api_key: SecretString::new("sk".into()),
            no_https: false,
            reasoning_budget: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = ClientRegistry::with_defaults();
        for name in ["openai", "deepseek", "openrouter", "ollama", "tongyi"] {
            assert!(registry.supports(name), "{name} missing");
        }
        assert!(registry.supports("OpenAI"));
    }

    #[test]
    fn test_unknown_type_is_construction_error() {
        let registry = ClientRegistry::with_defaults();
        let err = registry.build("nope", &options()).err().unwrap();
        assert_eq!(err.status_code(), 500);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_build_known_type() {
        let registry = ClientRegistry::with_defaults();
        let client = registry.build("deepseek", &options()).unwrap();
        assert!(client.name().contains("deepseek"));
    }
}
