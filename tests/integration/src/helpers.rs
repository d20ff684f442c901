//! Test helper utilities for integration tests

use gateway_config::GatewayConfig;
use gateway_core::{MemoryStore, ProviderRecord, ProviderStore};
use gateway_providers::ClientRegistry;
use gateway_server::{Balancer, GatewayState};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Initialize tracing for tests when `TEST_LOG` is set
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var("TEST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

/// A balancer on a loopback port backed by an in-memory store
pub struct TestBalancer {
    /// Bound address
    pub addr: SocketAddr,
    /// HTTP client for making requests
    pub client: Client,
    /// Base URL for the balancer
    pub base_url: String,
    /// Store the balancer persists into
    pub store: Arc<MemoryStore>,
    balancer: Arc<Balancer>,
    task: Option<JoinHandle<()>>,
}

impl TestBalancer {
    /// Seed a store from `config` and start accepting
    pub async fn start(config: &GatewayConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let state = GatewayState::from_config(config, store.clone(), ClientRegistry::with_defaults())
            .await
            .expect("state must load");
        let balancer = Arc::new(
            Balancer::bind(Arc::new(state), "127.0.0.1:0")
                .await
                .expect("bind loopback"),
        );
        balancer.start_sweepers();
        let addr = balancer.local_addr();

        let task = {
            let balancer = balancer.clone();
            tokio::spawn(async move {
                balancer.run().await.expect("balancer run");
            })
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create client");

        Self {
            addr,
            client,
            base_url: format!("http://{addr}"),
            store,
            balancer,
            task: Some(task),
        }
    }

    /// Full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Chat completion request with an optional bearer key
    pub fn chat(&self, key: Option<&str>, body: &Value) -> RequestBuilder {
        let request = self.client.post(self.url("/v1/chat/completions")).json(body);
        match key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// GET with an optional bearer key
    pub async fn get(&self, path: &str, key: Option<&str>) -> Response {
        let mut request = self.client.get(self.url(path));
        if let Some(key) = key {
            request = request.bearer_auth(key);
        }
        request.send().await.expect("request failed")
    }

    /// Send raw bytes and read until the balancer closes the connection
    pub async fn raw(&self, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(self.addr).await.expect("connect");
        stream.write_all(request).await.expect("write request");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read response");
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Providers of `model` as stored
    pub async fn providers(&self, model: &str) -> Vec<ProviderRecord> {
        let mut records: Vec<_> = self
            .store
            .active_providers()
            .await
            .expect("store read")
            .into_iter()
            .filter(|record| record.spec.wrapper_name == model)
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Wait until background stat writes for `model` reach `total` observations
    pub async fn wait_for_observations(&self, model: &str, total: u64) -> Vec<ProviderRecord> {
        for _ in 0..100 {
            let records = self.providers(model).await;
            let seen: u64 = records.iter().map(|r| r.counters.total_requests).sum();
            if seen >= total {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.providers(model).await
    }

    /// Stop the balancer and wait for the accept loop to exit
    pub async fn stop(mut self) {
        self.balancer.shutdown_gracefully(Duration::from_secs(1)).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestBalancer {
    fn drop(&mut self) {
        self.balancer.stop();
    }
}

/// `data:` payloads of an SSE body, `[DONE]` included
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.split("\r\n\r\n")
        .filter_map(|event| event.trim().strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

/// Concatenated delta content of streamed chunks
pub fn streamed_content(body: &str) -> String {
    sse_payloads(body)
        .iter()
        .filter(|payload| payload.as_str() != "[DONE]")
        .filter_map(|payload| serde_json::from_str::<Value>(payload).ok())
        .filter_map(|chunk| {
            chunk["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}

/// Assert an OpenAI-style error body and return its message
pub async fn error_message(response: Response) -> String {
    let body: Value = response.json().await.expect("error body is JSON");
    body["error"]["message"]
        .as_str()
        .expect("error.message present")
        .to_string()
}

/// Assert an OpenAI-style error body and return its type
pub async fn error_type(response: Response) -> String {
    let body: Value = response.json().await.expect("error body is JSON");
    body["error"]["type"]
        .as_str()
        .expect("error.type present")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_helpers() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\r\n\r\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\r\n\r\n\
                    data: [DONE]\r\n\r\n";
        assert_eq!(sse_payloads(body).len(), 3);
        assert_eq!(streamed_content(body), "Hello");
    }
}
