//! Upstream AI client capability.
//!
//! Every upstream wire format is hidden behind [`AiClient`]. Clients are
//! produced by a [`ClientFactory`] registered under a type name, from the
//! [`ClientOptions`] of one provider.

use crate::error::{GatewayError, GatewayResult};
use crate::request::Prompt;
use crate::streaming::DeltaKind;
use crate::types::ProviderSpec;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

/// Prompt used by health probes and validity checks
pub const PING_PROMPT: &str = "Ping. Please respond with 'Pong'.";

/// One text fragment produced by an upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelta {
    /// Channel of the fragment
    pub kind: DeltaKind,
    /// Fragment text
    pub text: String,
}

impl StreamDelta {
    /// Answer fragment
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            kind: DeltaKind::Content,
            text: text.into(),
        }
    }

    /// Reasoning fragment
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: DeltaKind::Reasoning,
            text: text.into(),
        }
    }
}

/// Stream of upstream fragments; dropping it releases the upstream connection
pub type DeltaStream = BoxStream<'static, GatewayResult<StreamDelta>>;

/// Capability implemented by every upstream client
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Descriptive name for logs
    fn name(&self) -> &str;

    /// Start a streamed chat call
    async fn chat_stream(&self, prompt: &Prompt) -> GatewayResult<DeltaStream>;

    /// Embed one text
    ///
    /// Clients without an embeddings endpoint keep this default, which fails
    /// with a retryable error so callers move on to the next provider.
    async fn embedding(&self, _input: &str) -> GatewayResult<Vec<f32>> {
        Err(GatewayError::provider(
            self.name(),
            "embeddings are not supported by this client",
            None,
            true,
        ))
    }

    /// Verify the credential and endpoint answer at all
    async fn check_valid(&self) -> GatewayResult<()> {
        let mut stream = self.chat_stream(&Prompt::text(PING_PROMPT)).await?;
        match stream.next().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e),
            None => Err(GatewayError::provider(
                self.name(),
                "upstream closed the stream without output",
                None,
                true,
            )),
        }
    }
}

/// Options a factory needs to build one client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Upstream model name
    pub model: String,
    /// Domain or full base URL
    pub domain_or_url: String,
    /// Credential
    pub api_key: SecretString,
    /// Use plain HTTP
    pub no_https: bool,
    /// Optional reasoning budget
    pub reasoning_budget: Option<u32>,
    /// Request timeout
    pub timeout: Duration,
}

impl ClientOptions {
    /// Options for a provider spec
    #[must_use]
    pub fn from_spec(spec: &ProviderSpec, timeout: Duration) -> Self {
        Self {
            model: spec.model_name.clone(),
            domain_or_url: spec.domain_or_url.clone(),
            api_key: spec.api_key.clone(),
            no_https: spec.no_https,
            reasoning_budget: spec.reasoning_budget,
            timeout,
        }
    }
}

/// Builds clients of one upstream type
pub trait ClientFactory: Send + Sync {
    /// Build a client for the given options
    fn build(&self, options: &ClientOptions) -> GatewayResult<Arc<dyn AiClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn(&ClientOptions) -> GatewayResult<Arc<dyn AiClient>> + Send + Sync,
{
    fn build(&self, options: &ClientOptions) -> GatewayResult<Arc<dyn AiClient>> {
        self(options)
    }
}
