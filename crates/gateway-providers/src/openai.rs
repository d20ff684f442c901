//! OpenAI-compatible streaming client.
//!
//! Most upstreams the balancer fronts speak the OpenAI chat-completions
//! dialect and differ only in their default base URL. Each such upstream is
//! an [`OpenAIFlavor`]; the client streams with `stream: true` and splits
//! `delta.content` from `delta.reasoning_content` / `delta.reasoning`.
//! Embeddings go to the sibling `/embeddings` endpoint of the same base.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use gateway_core::{
    AiClient, ClientFactory, ClientOptions, DeltaStream, GatewayError, GatewayResult, Prompt,
    StreamDelta,
};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible upstream type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAIFlavor {
    /// Registry type name
    pub type_name: &'static str,
    /// Base URL used when the provider gives none
    pub default_base_url: &'static str,
}

impl OpenAIFlavor {
    /// Built-in flavors
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        [
            ("openai", "https://api.openai.com/v1"),
            ("deepseek", "https://api.deepseek.com/v1"),
            ("moonshot", "https://api.moonshot.cn/v1"),
            ("siliconflow", "https://api.siliconflow.cn/v1"),
            ("openrouter", "https://openrouter.ai/api/v1"),
            ("tongyi", "https://dashscope.aliyuncs.com/compatible-mode/v1"),
            ("volcengine", "https://ark.cn-beijing.volces.com/api/v3"),
            ("ollama", "http://127.0.0.1:11434/v1"),
        ]
        .into_iter()
        .map(|(type_name, default_base_url)| Self {
            type_name,
            default_base_url,
        })
        .collect()
    }

    /// Resolve the chat-completions endpoint for a provider
    ///
    /// * empty → the flavor default
    /// * full URL → used as the base
    /// * bare domain → scheme + domain + the default path
    /// * domain with path → scheme + domain/path
    #[must_use]
    pub fn endpoint(&self, domain_or_url: &str, no_https: bool) -> String {
        let trimmed = domain_or_url.trim().trim_end_matches('/');
        let base = if trimmed.is_empty() {
            self.default_base_url.to_string()
        } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            let scheme = if no_https { "http" } else { "https" };
            if trimmed.contains('/') {
                format!("{scheme}://{trimmed}")
            } else {
                format!("{scheme}://{trimmed}{}", self.default_path())
            }
        };
        if base.ends_with("/chat/completions") {
            base
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn default_path(&self) -> &'static str {
        let without_scheme = self
            .default_base_url
            .split_once("://")
            .map_or(self.default_base_url, |(_, rest)| rest);
        without_scheme
            .find('/')
            .map_or("", |idx| &without_scheme[idx..])
    }
}

/// Factory producing [`OpenAICompatibleClient`]s of one flavor
#[derive(Debug, Clone, Copy)]
pub struct OpenAICompatibleFactory {
    flavor: OpenAIFlavor,
}

impl OpenAICompatibleFactory {
    /// Create a factory
    #[must_use]
    pub fn new(flavor: OpenAIFlavor) -> Self {
        Self { flavor }
    }
}

impl ClientFactory for OpenAICompatibleFactory {
    fn build(&self, options: &ClientOptions) -> GatewayResult<Arc<dyn AiClient>> {
        Ok(Arc::new(OpenAICompatibleClient::new(self.flavor, options)?))
    }
}

/// Streaming client for one OpenAI-compatible provider
pub struct OpenAICompatibleClient {
    name: String,
    endpoint: String,
    model: String,
    api_key: SecretString,
    reasoning_budget: Option<u32>,
    client: Client,
}

impl OpenAICompatibleClient {
    /// Build a client
    ///
    /// # Errors
    /// Returns a client-construction error when the HTTP client cannot be
    /// created or the endpoint is not a valid URL
    pub fn new(flavor: OpenAIFlavor, options: &ClientOptions) -> GatewayResult<Self> {
        let endpoint = flavor.endpoint(&options.domain_or_url, options.no_https);
        let name = format!("{}/{}", flavor.type_name, options.model);
        url::Url::parse(&endpoint).map_err(|e| {
            GatewayError::client_construction(&name, format!("invalid endpoint {endpoint}: {e}"))
        })?;

        let client = Client::builder()
            .connect_timeout(options.timeout)
            .build()
            .map_err(|e| GatewayError::client_construction(&name, e.to_string()))?;

        Ok(Self {
            name,
            endpoint,
            model: options.model.clone(),
            api_key: options.api_key.clone(),
            reasoning_budget: options.reasoning_budget,
            client,
        })
    }

    /// Resolved endpoint
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Embeddings endpoint next to the chat endpoint
    #[must_use]
    pub fn embeddings_endpoint(&self) -> String {
        let base = self
            .endpoint
            .strip_suffix("/chat/completions")
            .unwrap_or(&self.endpoint);
        format!("{base}/embeddings")
    }

    fn request_body(&self, prompt: &Prompt) -> ChatRequest {
        let content = if prompt.images.is_empty() {
            Value::String(prompt.text.clone())
        } else {
            let mut parts = vec![json!({"type": "text", "text": prompt.text})];
            parts.extend(
                prompt
                    .images
                    .iter()
                    .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
            );
            Value::Array(parts)
        };
        ChatRequest {
            model: self.model.clone(),
            messages: vec![json!({"role": "user", "content": content})],
            stream: true,
            thinking_budget: self.reasoning_budget,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsCall<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsReply {
    #[serde(default)]
    data: Vec<EmbeddingsReplyItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsReplyItem {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamChoiceDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Split one SSE `data:` payload into fragments
fn parse_chunk(data: &str) -> Result<Vec<StreamDelta>, serde_json::Error> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    let mut deltas = Vec::new();
    for choice in chunk.choices {
        let delta = choice.delta;
        if let Some(text) = delta.reasoning_content.or(delta.reasoning) {
            if !text.is_empty() {
                deltas.push(StreamDelta::reasoning(text));
            }
        }
        if let Some(text) = delta.content {
            if !text.is_empty() {
                deltas.push(StreamDelta::content(text));
            }
        }
    }
    Ok(deltas)
}

#[async_trait]
impl AiClient for OpenAICompatibleClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_stream(&self, prompt: &Prompt) -> GatewayResult<DeltaStream> {
        debug!(client = %self.name, endpoint = %self.endpoint, "Starting upstream stream");

        let request_builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt));

        let event_source = EventSource::new(request_builder).map_err(|e| {
            GatewayError::client_construction(&self.name, format!("cannot open stream: {e}"))
        })?;

        let name = self.name.clone();
        let stream = try_stream! {
            let mut es = event_source;

            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {
                        trace!(client = %name, "Upstream stream opened");
                    }
                    Ok(Event::Message(msg)) => {
                        let data = msg.data.trim();
                        if data == "[DONE]" {
                            break;
                        }
                        match parse_chunk(data) {
                            Ok(deltas) => {
                                for delta in deltas {
                                    yield delta;
                                }
                            }
                            Err(e) => {
                                warn!(client = %name, error = %e, "Skipping unparsable upstream chunk");
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)) => {
                        es.close();
                        Err(GatewayError::provider(
                            &name,
                            format!("upstream returned {status}"),
                            Some(status.as_u16()),
                            true,
                        ))?;
                    }
                    Err(e) => {
                        es.close();
                        Err(GatewayError::provider(&name, format!("stream error: {e}"), None, true))?;
                    }
                }
            }
            es.close();
        };

        Ok(Box::pin(stream))
    }

    async fn embedding(&self, input: &str) -> GatewayResult<Vec<f32>> {
        let endpoint = self.embeddings_endpoint();
        debug!(client = %self.name, endpoint = %endpoint, "Requesting embedding");

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&EmbeddingsCall {
                model: &self.model,
                input,
                encoding_format: "float",
            })
            .send()
            .await
            .map_err(|e| GatewayError::provider(&self.name, format!("request failed: {e}"), None, true))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::provider(
                &self.name,
                format!("upstream returned {status}"),
                Some(status.as_u16()),
                true,
            ));
        }

        let reply: EmbeddingsReply = response.json().await.map_err(|e| {
            GatewayError::provider(&self.name, format!("invalid embeddings reply: {e}"), None, true)
        })?;
        reply
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| {
                GatewayError::provider(&self.name, "embeddings reply carried no vector", None, true)
            })
    }
}
