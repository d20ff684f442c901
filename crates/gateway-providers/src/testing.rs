//! Scripted clients for tests.
//!
//! A [`ScriptedFactory`] maps a provider's `domain_or_url` to a [`Script`]
//! describing what the upstream does: emit fragments, pause, fail, or panic.
//! A script may also carry the vector its embeddings calls answer with.
//! Register it under any type name in a [`crate::ClientRegistry`].

use async_stream::try_stream;
use async_trait::async_trait;
use gateway_core::{
    AiClient, ClientFactory, ClientOptions, DeltaStream, GatewayError, GatewayResult, Prompt,
    StreamDelta,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One step of a scripted upstream
#[derive(Debug, Clone)]
pub enum Step {
    /// Emit a fragment
    Delta(StreamDelta),
    /// Pause
    Sleep(Duration),
    /// Fail the stream
    Fail(String),
    /// Panic inside the stream
    Panic,
}

/// Behaviour of a scripted upstream
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Fail `chat_stream` itself with this message
    pub open_error: Option<String>,
    /// Steps played by the stream
    pub steps: Vec<Step>,
    /// Vector returned by `embedding`; `None` fails the call
    pub embedding: Option<Vec<f32>>,
}

impl Script {
    /// Upstream answering with one content fragment
    pub fn reply(text: impl Into<String>) -> Self {
        Self::default().then(Step::Delta(StreamDelta::content(text)))
    }

    /// Upstream that refuses the call
    pub fn refuse(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Upstream answering embeddings calls with `vector`
    pub fn embed(vector: Vec<f32>) -> Self {
        Self {
            embedding: Some(vector),
            ..Self::default()
        }
    }

    /// Append a step
    #[must_use]
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a content fragment
    #[must_use]
    pub fn content(self, text: impl Into<String>) -> Self {
        self.then(Step::Delta(StreamDelta::content(text)))
    }

    /// Append a reasoning fragment
    #[must_use]
    pub fn reasoning(self, text: impl Into<String>) -> Self {
        self.then(Step::Delta(StreamDelta::reasoning(text)))
    }

    /// Append a pause
    #[must_use]
    pub fn sleep(self, duration: Duration) -> Self {
        self.then(Step::Sleep(duration))
    }

    /// Append a failure
    #[must_use]
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.then(Step::Fail(message.into()))
    }
}

#[derive(Default)]
struct Counters {
    builds: AtomicUsize,
    calls: AtomicUsize,
}

/// Factory serving scripts keyed by `domain_or_url`
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    counters: Arc<Mutex<HashMap<String, Arc<Counters>>>>,
}

impl ScriptedFactory {
    /// Create an empty factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a script
    #[must_use]
    pub fn with_script(self, domain: impl Into<String>, script: Script) -> Self {
        self.set_script(domain, script);
        self
    }

    /// Add or replace a script in place
    pub fn set_script(&self, domain: impl Into<String>, script: Script) {
        self.scripts.lock().insert(domain.into(), script);
    }

    fn counters(&self, domain: &str) -> Arc<Counters> {
        self.counters
            .lock()
            .entry(domain.to_string())
            .or_default()
            .clone()
    }

    /// Clients built for a domain
    #[must_use]
    pub fn builds(&self, domain: &str) -> usize {
        self.counters(domain).builds.load(Ordering::SeqCst)
    }

    /// `chat_stream` and `embedding` calls made against a domain
    #[must_use]
    pub fn calls(&self, domain: &str) -> usize {
        self.counters(domain).calls.load(Ordering::SeqCst)
    }
}

impl ClientFactory for ScriptedFactory {
    fn build(&self, options: &ClientOptions) -> GatewayResult<Arc<dyn AiClient>> {
        let domain = options.domain_or_url.clone();
        if !self.scripts.lock().contains_key(&domain) {
            return Err(GatewayError::client_construction(
                &domain,
                "no script registered",
            ));
        }
        let counters = self.counters(&domain);
        counters.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedClient {
            name: format!("scripted/{domain}"),
            domain,
            scripts: self.scripts.clone(),
            counters,
        }))
    }
}

/// Client playing the current script of its domain
pub struct ScriptedClient {
    name: String,
    domain: String,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    counters: Arc<Counters>,
}

impl ScriptedClient {
    fn current(&self) -> Script {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .get(&self.domain)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AiClient for ScriptedClient {
    fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::panic)]
    async fn chat_stream(&self, _prompt: &Prompt) -> GatewayResult<DeltaStream> {
        let script = self.current();
        if let Some(message) = script.open_error {
            return Err(GatewayError::provider(&self.name, message, None, true));
        }
        let name = self.name.clone();
        let stream = try_stream! {
            for step in script.steps {
                match step {
                    Step::Delta(delta) => yield delta,
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Fail(message) => {
                        Err(GatewayError::provider(&name, message, None, true))?;
                    }
                    Step::Panic => panic!("scripted upstream panic"),
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embedding(&self, _input: &str) -> GatewayResult<Vec<f32>> {
        let script = self.current();
        if let Some(message) = script.open_error {
            return Err(GatewayError::provider(&self.name, message, None, true));
        }
        script.embedding.ok_or_else(|| {
            GatewayError::provider(&self.name, "no embedding scripted", None, true)
        })
    }
}
