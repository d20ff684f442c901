//! Embeddings handling.
//!
//! Same admission rules as chat, same provider pool per model. Providers
//! are tried without repeats until one embeds every input; the answer is a
//! single JSON body, so failover is possible for the whole call.

use crate::chat::{authorize, ensure_providers, final_error};
use crate::http::{write_error, write_json, HttpRequest};
use crate::state::GatewayState;
use gateway_core::{EmbeddingRequest, EmbeddingResponse, GatewayError, GatewayResult};
use gateway_providers::Provider;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWrite;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Route path
pub const ROUTE_PATH: &str = "/v1/embeddings";

/// A validated embeddings request
#[derive(Debug, Clone)]
pub struct EmbeddingCall {
    /// Logical model
    pub model: String,
    /// Texts to embed, in order
    pub inputs: Vec<String>,
    /// Key traffic is accounted to
    pub account: String,
}

impl EmbeddingCall {
    fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|text| text.len() as u64).sum()
    }
}

/// Authenticate and parse an embeddings request
///
/// # Errors
/// `400` for a bad body, model or input; otherwise as [`authorize`]
pub async fn prepare(state: &GatewayState, request: &HttpRequest) -> GatewayResult<EmbeddingCall> {
    let body = EmbeddingRequest::parse(&request.body)?;
    let model = body.model.trim().to_string();
    if model.is_empty() {
        return Err(GatewayError::validation("model is required", Some("model".into())));
    }
    let account = authorize(state, request, &model).await?;
    if body.input.is_empty() {
        return Err(GatewayError::validation("empty input", Some("input".into())));
    }
    if let Some(format) = body.encoding_format.as_deref() {
        if format != "float" {
            return Err(GatewayError::validation(
                format!("unsupported encoding_format {format}"),
                Some("encoding_format".into()),
            ));
        }
    }

    Ok(EmbeddingCall {
        model,
        inputs: body.input.texts().into_iter().map(str::to_string).collect(),
        account,
    })
}

async fn attempt(
    state: &GatewayState,
    call: &EmbeddingCall,
    provider: &Provider,
) -> GatewayResult<Vec<Vec<f32>>> {
    let upstream_timeout = state.options().upstream_timeout;
    let client = provider.client(state.clients(), upstream_timeout)?;
    let mut vectors = Vec::with_capacity(call.inputs.len());
    for input in &call.inputs {
        let vector = timeout(upstream_timeout, client.embedding(input))
            .await
            .map_err(|_| GatewayError::timeout(provider.describe(), upstream_timeout))??;
        vectors.push(vector);
    }
    Ok(vectors)
}

/// Serve a prepared call over the provider pool; returns the status sent
pub async fn dispatch<W>(state: &GatewayState, call: &EmbeddingCall, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin,
{
    let entrypoints = state.entrypoints();
    let metrics = state.metrics();
    let model = call.model.as_str();
    let pool_size = entrypoints.pool_size(model);
    let mut tried: Vec<Arc<Provider>> = Vec::new();
    let mut last_error = None;
    let mut response = None;

    while let Some(provider) = entrypoints.peek_untried(model, &tried) {
        tried.push(provider.clone());
        let started = Instant::now();
        let result = attempt(state, call, &provider).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(vectors) => {
                info!(
                    model,
                    provider = %provider.describe(),
                    inputs = vectors.len(),
                    dimensions = vectors.first().map_or(0, Vec::len),
                    latency_ms = elapsed_ms,
                    "Embedding served"
                );
                metrics.record_attempt(model, true);
                state.spawn_provider_stats(provider.id(), true, elapsed_ms);
                response = Some(EmbeddingResponse::new(model, vectors, call.input_bytes()));
                break;
            }
            Err(e) => {
                warn!(
                    model,
                    provider = %provider.describe(),
                    attempt = tried.len(),
                    pool_size,
                    error = %e,
                    "Embedding provider failed"
                );
                metrics.record_attempt(model, false);
                state.spawn_provider_stats(provider.id(), false, elapsed_ms);
                let stop = !e.is_retryable();
                last_error = Some(e);
                if stop {
                    break;
                }
            }
        }
    }

    let (status, output_bytes, written) = match response {
        Some(response) => (200, response.vector_bytes(), write_json(conn, 200, &response).await),
        None => {
            let error = final_error(model, pool_size, tried.len(), last_error);
            warn!(model, attempts = tried.len(), error = %error, "Embedding request failed");
            (error.status_code(), 0, write_error(conn, &error).await)
        }
    };
    if let Err(e) = written {
        debug!(model, error = %e, "Client went away before the embedding response");
    }

    state.spawn_key_traffic(&call.account, call.input_bytes(), output_bytes, status == 200);
    status
}

/// Serve one embeddings request; returns the status sent
pub async fn handle<W>(state: &GatewayState, request: &HttpRequest, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin,
{
    let prepared = match prepare(state, request).await {
        Ok(call) => ensure_providers(state, &call.model).await.map(|_| call),
        Err(error) => Err(error),
    };
    match prepared {
        Ok(call) => dispatch(state, &call, conn).await,
        Err(error) => {
            debug!(error = %error, "Embedding request rejected");
            if let Err(e) = write_error(conn, &error).await {
                debug!(error = %e, "Client went away before the error response");
            }
            error.status_code()
        }
    }
}
