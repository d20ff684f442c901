//! Test fixtures: configuration documents and request bodies

use gateway_config::{parse_yaml, GatewayConfig};
use serde_json::{json, Value};

/// Caller key allowed on [`TEST_MODEL`]
pub const TEST_KEY: &str = "sk-integration";

/// Model served by the mock upstreams
pub const TEST_MODEL: &str = "gpt-4o";

/// Model declared without providers
pub const EMPTY_MODEL: &str = "reserved-model";

/// Free model served to the built-in free account
pub const FREE_MODEL: &str = "qwen-free";

/// Configuration builder for a balancer under test
#[derive(Debug, Default, Clone)]
pub struct TestConfig {
    upstreams: Vec<String>,
    free_upstreams: Vec<String>,
    amap_base: Option<String>,
    search_keys: Vec<(String, String)>,
    otp_secret: Option<String>,
    allow_free: bool,
}

impl TestConfig {
    /// Configuration with no upstreams
    pub fn new() -> Self {
        Self {
            allow_free: true,
            ..Self::default()
        }
    }

    /// Serve [`TEST_MODEL`] from these OpenAI-compatible base URLs
    pub fn with_upstreams<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstreams = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Serve [`FREE_MODEL`] from these base URLs
    pub fn with_free_upstreams<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.free_upstreams = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Geocoding pool with one key against `base_url`
    pub fn with_amap(mut self, base_url: impl Into<String>) -> Self {
        self.amap_base = Some(base_url.into());
        self
    }

    /// Add a web-search key
    pub fn with_search_key(mut self, searcher: &str, base_url: impl Into<String>) -> Self {
        self.search_keys.push((searcher.to_string(), base_url.into()));
        self
    }

    /// Require a one-time code on the web-search route
    pub fn with_otp_secret(mut self, secret: impl Into<String>) -> Self {
        self.otp_secret = Some(secret.into());
        self
    }

    /// Refuse trace-id callers on the proxies
    pub fn without_free_users(mut self) -> Self {
        self.allow_free = false;
        self
    }

    /// Render the YAML document
    pub fn to_yaml(&self) -> String {
        let providers = |urls: &[String]| -> String {
            if urls.is_empty() {
                return "    providers: []\n".to_string();
            }
            let entries: String = urls
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    format!(
                        "      - type_name: openai\n        domain_or_url: \"{url}\"\n        api_key: upstream-{i}\n"
                    )
                })
                .collect();
            format!("    providers:\n{entries}")
        };

        let mut yaml = format!(
            "server:\n  listen: \"127.0.0.1:0\"\n  read_timeout: 5s\n  upstream_timeout: 5s\n  rate_limit_wait: 1s\n\
             health:\n  enabled: false\n\
             keys:\n  - key: {TEST_KEY}\n    allowed_models: [{TEST_MODEL}, {EMPTY_MODEL}]\n\
             models:\n  - name: {TEST_MODEL}\n{}  - name: {EMPTY_MODEL}\n",
            providers(&self.upstreams)
        );
        if !self.free_upstreams.is_empty() {
            yaml.push_str(&format!(
                "  - name: {FREE_MODEL}\n{}",
                providers(&self.free_upstreams)
            ));
        }

        yaml.push_str(&format!("amap:\n  allow_free_users: {}\n", self.allow_free));
        if let Some(base) = &self.amap_base {
            yaml.push_str(&format!(
                "  base_url: \"{base}\"\n  keys:\n    - api_key: amap-pool-key\n"
            ));
        }

        yaml.push_str(&format!(
            "web_search:\n  allow_free_users: {}\n",
            self.allow_free
        ));
        if let Some(secret) = &self.otp_secret {
            yaml.push_str(&format!("  otp_secret: \"{secret}\"\n"));
        }
        if !self.search_keys.is_empty() {
            yaml.push_str("  keys:\n");
            for (i, (searcher, base)) in self.search_keys.iter().enumerate() {
                yaml.push_str(&format!(
                    "    - sub_type: {searcher}\n      api_key: search-key-{i}\n      base_url: \"{base}\"\n"
                ));
            }
        }
        yaml
    }

    /// Parse into a gateway configuration
    pub fn build(&self) -> GatewayConfig {
        parse_yaml(&self.to_yaml()).expect("test configuration must parse")
    }
}

/// Chat request body with one user message
pub fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "Say hello"}]
    })
}

/// Embeddings request body
pub fn embedding_body(model: &str, input: Value) -> Value {
    json!({"model": model, "input": input})
}

/// Web-search request body
pub fn search_body(query: &str, searcher: &str) -> Value {
    json!({
        "query": query,
        "searcher_type": searcher,
        "max_results": 5
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_document_parses() {
        let config = TestConfig::new()
            .with_upstreams(["http://127.0.0.1:1/v1", "http://127.0.0.1:2/v1"])
            .with_free_upstreams(["http://127.0.0.1:3/v1"])
            .with_amap("http://127.0.0.1:4")
            .with_search_key("brave", "http://127.0.0.1:5")
            .with_otp_secret("shared-otp-secret")
            .build();
        assert_eq!(config.models.len(), 3);
        assert_eq!(config.provider_specs().len(), 3);
        assert_eq!(config.amap.keys.len(), 1);
        assert_eq!(config.web_search.keys[0].sub_type, "brave");
        assert!(config.web_search.otp_secret.is_some());
        assert!(!config.health.enabled);
    }
}
