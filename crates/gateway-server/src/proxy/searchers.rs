//! Web-search backends.
//!
//! Each [`Searcher`] speaks one vendor API and normalizes its answer into
//! [`SearchResult`]s. Every failure is reported as a retryable provider
//! error so the key-pool failover moves on to the next key.

use async_trait::async_trait;
use gateway_core::{GatewayError, GatewayResult, PoolKey};
use reqwest::RequestBuilder;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One normalized search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Page title
    pub title: String,
    /// Page URL
    pub url: String,
    /// Snippet or summary
    pub content: String,
    /// Searcher that produced the hit
    pub source: String,
}

/// Parameters of one search call
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Query text
    pub query: String,
    /// One-based page number
    pub page: u32,
    /// Results per page
    pub page_size: u32,
}

/// A web-search vendor
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Searcher type, matching the pool key sub-type
    fn name(&self) -> &'static str;

    /// Base URL used when the key carries no override
    fn default_base_url(&self) -> &'static str;

    /// Run one search with one key
    async fn search(
        &self,
        http: &reqwest::Client,
        key: &PoolKey,
        query: &SearchQuery,
    ) -> GatewayResult<Vec<SearchResult>>;
}

fn base_url<'a>(searcher: &'a dyn Searcher, key: &'a PoolKey) -> &'a str {
    key.base_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| searcher.default_base_url())
        .trim_end_matches('/')
}

async fn send_json(name: &str, request: RequestBuilder) -> GatewayResult<Value> {
    let response = request
        .send()
        .await
        .map_err(|e| GatewayError::provider(name, e.to_string(), None, true))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::provider(name, e.to_string(), Some(status.as_u16()), true))?;
    if !status.is_success() {
        let snippet: String = body.chars().take(200).collect();
        return Err(GatewayError::provider(
            name,
            format!("status {status}: {snippet}"),
            Some(status.as_u16()),
            true,
        ));
    }
    serde_json::from_str(&body)
        .map_err(|e| GatewayError::provider(name, format!("invalid response: {e}"), None, true))
}

fn text(item: &Value, field: &str) -> String {
    item.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Collect hits from an array at `pointer`, reading the given fields
fn collect(
    source: &str,
    body: &Value,
    pointer: &str,
    (title, url, content): (&str, &str, &str),
) -> Vec<SearchResult> {
    body.pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| SearchResult {
                    title: text(item, title),
                    url: text(item, url),
                    content: text(item, content),
                    source: source.to_string(),
                })
                .filter(|r| !r.url.is_empty() || !r.title.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Brave Search API
#[derive(Debug, Default)]
pub struct BraveSearcher;

#[async_trait]
impl Searcher for BraveSearcher {
    fn name(&self) -> &'static str {
        "brave"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.search.brave.com"
    }

    async fn search(
        &self,
        http: &reqwest::Client,
        key: &PoolKey,
        query: &SearchQuery,
    ) -> GatewayResult<Vec<SearchResult>> {
        let url = format!("{}/res/v1/web/search", base_url(self, key));
        let offset = query.page.saturating_sub(1);
        let request = http
            .get(url)
            .header("X-Subscription-Token", key.api_key.expose_secret())
            .header("Accept", "application/json")
            .query(&[
                ("q", query.query.clone()),
                ("count", query.page_size.to_string()),
                ("offset", offset.to_string()),
            ]);
        let body = send_json(self.name(), request).await?;
        Ok(collect(
            self.name(),
            &body,
            "/web/results",
            ("title", "url", "description"),
        ))
    }
}

/// Tavily search API
#[derive(Debug, Default)]
pub struct TavilySearcher;

#[async_trait]
impl Searcher for TavilySearcher {
    fn name(&self) -> &'static str {
        "tavily"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.tavily.com"
    }

    async fn search(
        &self,
        http: &reqwest::Client,
        key: &PoolKey,
        query: &SearchQuery,
    ) -> GatewayResult<Vec<SearchResult>> {
        let url = format!("{}/search", base_url(self, key));
        let request = http.post(url).json(&json!({
            "api_key": key.api_key.expose_secret(),
            "query": query.query,
            "max_results": query.page_size,
        }));
        let body = send_json(self.name(), request).await?;
        Ok(collect(self.name(), &body, "/results", ("title", "url", "content")))
    }
}

/// Zhipu web-search API
#[derive(Debug, Default)]
pub struct ChatGlmSearcher;

#[async_trait]
impl Searcher for ChatGlmSearcher {
    fn name(&self) -> &'static str {
        "chatglm"
    }

    fn default_base_url(&self) -> &'static str {
        "https://open.bigmodel.cn"
    }

    async fn search(
        &self,
        http: &reqwest::Client,
        key: &PoolKey,
        query: &SearchQuery,
    ) -> GatewayResult<Vec<SearchResult>> {
        let url = format!("{}/api/paas/v4/web_search", base_url(self, key));
        let request = http
            .post(url)
            .bearer_auth(key.api_key.expose_secret())
            .json(&json!({
                "search_query": query.query,
                "search_engine": "search_std",
                "count": query.page_size,
            }));
        let body = send_json(self.name(), request).await?;
        Ok(collect(
            self.name(),
            &body,
            "/search_result",
            ("title", "link", "content"),
        ))
    }
}

/// Bocha web-search API
#[derive(Debug, Default)]
pub struct BochaSearcher;

#[async_trait]
impl Searcher for BochaSearcher {
    fn name(&self) -> &'static str {
        "bocha"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.bochaai.com"
    }

    async fn search(
        &self,
        http: &reqwest::Client,
        key: &PoolKey,
        query: &SearchQuery,
    ) -> GatewayResult<Vec<SearchResult>> {
        let url = format!("{}/v1/web-search", base_url(self, key));
        let request = http
            .post(url)
            .bearer_auth(key.api_key.expose_secret())
            .json(&json!({
                "query": query.query,
                "count": query.page_size,
                "page": query.page,
                "summary": false,
            }));
        let body = send_json(self.name(), request).await?;
        Ok(collect(
            self.name(),
            &body,
            "/data/webPages/value",
            ("name", "url", "snippet"),
        ))
    }
}

/// Searchers by type name
#[derive(Clone, Default)]
pub struct SearcherRegistry {
    searchers: BTreeMap<String, Arc<dyn Searcher>>,
}

impl SearcherRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in searcher
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BraveSearcher));
        registry.register(Arc::new(TavilySearcher));
        registry.register(Arc::new(ChatGlmSearcher));
        registry.register(Arc::new(BochaSearcher));
        registry
    }

    /// Add or replace a searcher
    pub fn register(&mut self, searcher: Arc<dyn Searcher>) {
        self.searchers.insert(searcher.name().to_string(), searcher);
    }

    /// Searcher for a type
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Searcher>> {
        self.searchers.get(&name.to_lowercase()).cloned()
    }

    /// Whether a type is known
    #[must_use]
    pub fn supports(&self, name: &str) -> bool {
        self.searchers.contains_key(&name.to_lowercase())
    }

    /// Known type names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.searchers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::PoolKind;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(server: &MockServer, sub_type: &str) -> PoolKey {
        PoolKey::new(1, PoolKind::WebSearch, sub_type, "search-key").with_base_url(server.uri())
    }

    fn query() -> SearchQuery {
        SearchQuery {
            query: "rust".into(),
            page: 2,
            page_size: 5,
        }
    }

    #[tokio::test]
    async fn test_brave() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res/v1/web/search"))
            .and(header("X-Subscription-Token", "search-key"))
            .and(query_param("q", "rust"))
            .and(query_param("offset", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "web": {"results": [{"title": "Rust", "url": "https://rust-lang.org", "description": "lang"}]}
            })))
            .mount(&server)
            .await;

        let results = BraveSearcher
            .search(&reqwest::Client::new(), &key(&server, "brave"), &query())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "lang");
        assert_eq!(results[0].source, "brave");
    }

    #[tokio::test]
    async fn test_bocha_and_chatglm_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/web-search"))
            .and(header("Authorization", "Bearer search-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"webPages": {"value": [{"name": "A", "url": "https://a", "snippet": "s"}]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/paas/v4/web_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "search_result": [{"title": "B", "link": "https://b", "content": "c"}]
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let bocha = BochaSearcher.search(&http, &key(&server, "bocha"), &query()).await.unwrap();
        assert_eq!(bocha[0].title, "A");
        let glm = ChatGlmSearcher.search(&http, &key(&server, "chatglm"), &query()).await.unwrap();
        assert_eq!(glm[0].url, "https://b");
    }

    #[tokio::test]
    async fn test_upstream_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = TavilySearcher
            .search(&reqwest::Client::new(), &key(&server, "tavily"), &query())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn test_registry() {
        let registry = SearcherRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["bocha", "brave", "chatglm", "tavily"]);
        assert!(registry.supports("Brave"));
        assert!(registry.get("google").is_none());
    }
}
