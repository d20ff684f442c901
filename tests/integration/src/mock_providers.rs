//! Mock upstreams for integration testing
//!
//! Wiremock servers that speak the OpenAI streaming and embeddings
//! protocols, the geocoding API and one web-search backend.

use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Render OpenAI-style SSE events for a list of content pieces
pub fn sse_body(pieces: &[&str]) -> String {
    let mut body = String::new();
    for piece in pieces {
        let chunk = json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": piece}}]
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Mock OpenAI-compatible chat upstream
pub struct MockUpstream {
    /// Underlying server
    pub server: MockServer,
}

impl MockUpstream {
    /// Start an upstream with no behavior mounted
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Start an upstream that streams `pieces`
    pub async fn replying(pieces: &[&str]) -> Self {
        let upstream = Self::start().await;
        upstream.mock_stream(pieces).await;
        upstream
    }

    /// Start an upstream that answers every request with `status`
    pub async fn failing(status: u16) -> Self {
        let upstream = Self::start().await;
        upstream.mock_status(status).await;
        upstream
    }

    /// Base URL the balancer should use
    pub fn base_url(&self) -> String {
        format!("{}/v1", self.server.uri())
    }

    /// Stream `pieces` then `[DONE]`
    pub async fn mock_stream(&self, pieces: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(pieces), "text/event-stream"),
            )
            .mount(&self.server)
            .await;
    }

    /// Stream `pieces` after a delay
    pub async fn mock_stream_delayed(&self, pieces: &[&str], delay: Duration) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(pieces), "text/event-stream")
                    .set_delay(delay),
            )
            .mount(&self.server)
            .await;
    }

    /// Answer with an error status
    pub async fn mock_status(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": {"message": "upstream unavailable", "type": "server_error"}
            })))
            .mount(&self.server)
            .await;
    }

    /// Answer embeddings requests with `vector` for every input
    pub async fn mock_embedding(&self, vector: &[f32]) {
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{"object": "embedding", "embedding": vector, "index": 0}]
            })))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received, chat and embeddings
    pub async fn calls(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map_or(0, |requests| requests.len())
    }
}

/// Base URL nothing listens on
pub fn unreachable_base_url() -> String {
    "http://127.0.0.1:1/v1".to_string()
}

/// Mock geocoding API
pub struct MockAmap {
    /// Underlying server
    pub server: MockServer,
}

impl MockAmap {
    /// Start a geocoding API answering `/v3/geocode/geo` for the pool key
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/geocode/geo"))
            .and(query_param("key", "amap-pool-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "1",
                "info": "OK",
                "infocode": "10000",
                "geocodes": [{"formatted_address": "Beijing", "location": "116.4,39.9"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex("^/v3/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "0",
                "info": "INVALID_USER_KEY",
                "infocode": "10001"
            })))
            .mount(&server)
            .await;
        Self { server }
    }

    /// Base URL the balancer should use
    pub fn base_url(&self) -> String {
        self.server.uri()
    }

    /// Query strings the upstream received
    pub async fn received_queries(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| request.url.query().unwrap_or_default().to_string())
            .collect()
    }
}

/// Mock Brave search API
pub struct MockSearch {
    /// Underlying server
    pub server: MockServer,
}

impl MockSearch {
    /// Start a backend returning `hits` results
    pub async fn start(hits: usize) -> Self {
        let server = MockServer::start().await;
        let results: Vec<_> = (0..hits)
            .map(|i| {
                json!({
                    "title": format!("Result {i}"),
                    "url": format!("https://example.com/{i}"),
                    "description": "snippet"
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/res/v1/web/search"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"web": {"results": results}})),
            )
            .mount(&server)
            .await;
        Self { server }
    }

    /// Start a backend answering every search with `status`
    pub async fn failing(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res/v1/web/search"))
            .respond_with(ResponseTemplate::new(status).set_body_string("quota exceeded"))
            .mount(&server)
            .await;
        Self { server }
    }

    /// Base URL the balancer should use
    pub fn base_url(&self) -> String {
        self.server.uri()
    }

    /// Number of searches received
    pub async fn calls(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map_or(0, |requests| requests.len())
    }
}
