//! Chat-completions handling.
//!
//! A request is authenticated, parsed into a single prompt and then served
//! by a randomly selected provider of the requested model. Providers are
//! failed over only while nothing has reached the client; once output has
//! started, an upstream failure terminates the stream instead. The
//! [`StreamChunkWriter`] is closed on every path that produced output, and
//! the upstream stream is dropped with the attempt that opened it.

use crate::http::{write_error, HttpRequest};
use crate::state::GatewayState;
use crate::writer::{ResponseMode, StreamChunkWriter};
use futures::StreamExt;
use gateway_core::{
    is_free_model, mask_secret, ChatCompletionRequest, GatewayError, GatewayResult, Prompt,
    FREE_USER_KEY,
};
use gateway_providers::Provider;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Route path
pub const ROUTE_PATH: &str = "/v1/chat/completions";

/// A validated chat request
#[derive(Debug, Clone)]
pub struct ChatCall {
    /// Logical model
    pub model: String,
    /// Whether to stream
    pub stream: bool,
    /// Flattened conversation
    pub prompt: Prompt,
    /// Key traffic is accounted to
    pub account: String,
}

enum AttemptError {
    /// Nothing reached the client; another provider may be tried
    BeforeOutput(GatewayError),
    /// The upstream failed mid-stream
    AfterOutput(GatewayError),
    /// Writing to the client failed
    ClientGone(io::Error),
}

/// Resolve the account a call on `model` is charged to
///
/// Free models skip key checks entirely, whatever the caller sends. Every
/// other model needs a known bearer key that allows it and still has quota.
///
/// # Errors
/// `401`, `403`, `404` or `429` per the failed check
pub async fn authorize(
    state: &GatewayState,
    request: &HttpRequest,
    model: &str,
) -> GatewayResult<String> {
    if is_free_model(model) {
        return Ok(FREE_USER_KEY.to_string());
    }

    let token = request
        .bearer_token()
        .ok_or_else(|| GatewayError::authentication("missing api key"))?;
    let key = state
        .keys()
        .get(token)
        .ok_or_else(|| GatewayError::authentication("invalid api key"))?;
    if !key.allows(model) {
        return Err(if state.entrypoints().contains_model(model) {
            GatewayError::forbidden(format!("model {model} is not allowed for this key"))
        } else {
            GatewayError::model_not_found(model)
        });
    }
    if !state.store().traffic_allowed(&key.key).await? {
        return Err(GatewayError::TrafficLimitExceeded {
            key: mask_secret(&key.key),
        });
    }
    Ok(key.key)
}

/// Authenticate and parse a chat request
///
/// # Errors
/// `401`, `400`, `403`, `404` or `429` per the failed check
pub async fn prepare(state: &GatewayState, request: &HttpRequest) -> GatewayResult<ChatCall> {
    let body = ChatCompletionRequest::parse(&request.body)?;
    let model = body.model.trim().to_string();
    if model.is_empty() {
        return Err(GatewayError::validation("model is required", Some("model".into())));
    }
    let account = authorize(state, request, &model).await?;
    let prompt = body.build_prompt();
    if prompt.is_empty() {
        return Err(GatewayError::validation("empty prompt", Some("messages".into())));
    }

    Ok(ChatCall {
        model,
        stream: body.stream,
        prompt,
        account,
    })
}

/// Make sure the model has providers, reloading from the store once
///
/// # Errors
/// [`GatewayError::NoProvider`] for a known model without providers,
/// [`GatewayError::ModelNotFound`] otherwise
pub async fn ensure_providers(state: &GatewayState, model: &str) -> GatewayResult<usize> {
    let entrypoints = state.entrypoints();
    let size = entrypoints.pool_size(model);
    if size > 0 {
        return Ok(size);
    }
    info!(model, "No providers registered, reloading from store");
    state.reload_providers().await?;
    match entrypoints.pool_size(model) {
        0 if entrypoints.contains_model(model) => Err(GatewayError::no_provider(model)),
        0 => Err(GatewayError::model_not_found(model)),
        size => Ok(size),
    }
}

/// Stream one provider's answer into the writer; returns time to first byte
async fn attempt<W>(
    state: &GatewayState,
    call: &ChatCall,
    provider: &Provider,
    writer: &StreamChunkWriter<W>,
) -> Result<Duration, AttemptError>
where
    W: AsyncWrite + Unpin + Send,
{
    let upstream_timeout = state.options().upstream_timeout;
    let started = Instant::now();
    let client = provider
        .client(state.clients(), upstream_timeout)
        .map_err(AttemptError::BeforeOutput)?;

    let mut stream = match timeout(upstream_timeout, client.chat_stream(&call.prompt)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(AttemptError::BeforeOutput(e)),
        Err(_) => {
            return Err(AttemptError::BeforeOutput(GatewayError::timeout(
                provider.describe(),
                upstream_timeout,
            )))
        }
    };

    let mut first_byte = None;
    loop {
        let item = match timeout(upstream_timeout, stream.next()).await {
            Ok(item) => item,
            Err(_) => Some(Err(GatewayError::timeout(provider.describe(), upstream_timeout))),
        };
        match item {
            None => break,
            Some(Ok(delta)) => {
                if delta.text.is_empty() {
                    continue;
                }
                if first_byte.is_none() {
                    let elapsed = started.elapsed();
                    state.metrics().observe_first_byte(&call.model, elapsed);
                    first_byte = Some(elapsed);
                }
                writer
                    .write_delta(&delta)
                    .await
                    .map_err(AttemptError::ClientGone)?;
            }
            Some(Err(e)) if first_byte.is_some() => return Err(AttemptError::AfterOutput(e)),
            Some(Err(e)) => return Err(AttemptError::BeforeOutput(e)),
        }
    }

    first_byte.ok_or_else(|| {
        AttemptError::BeforeOutput(GatewayError::provider(
            provider.describe(),
            "upstream closed the stream without output",
            None,
            true,
        ))
    })
}

pub(crate) fn final_error(
    model: &str,
    pool_size: usize,
    attempts: usize,
    last_error: Option<GatewayError>,
) -> GatewayError {
    match last_error {
        Some(error @ GatewayError::ClientConstruction { .. }) if pool_size == 1 => error,
        Some(error) if !error.is_retryable() => error,
        Some(error) => GatewayError::exhausted(model, attempts, error.to_string()),
        None => GatewayError::no_provider(model),
    }
}

/// Serve a prepared call over the provider pool; returns the status sent
pub async fn dispatch<W>(state: &GatewayState, call: &ChatCall, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin + Send,
{
    let entrypoints = state.entrypoints();
    let metrics = state.metrics();
    let model = call.model.as_str();
    let pool_size = entrypoints.pool_size(model);
    let mode = if call.stream {
        ResponseMode::Stream
    } else {
        ResponseMode::Buffered
    };

    let writer = StreamChunkWriter::new(&mut *conn, model, mode);
    let mut tried: Vec<Arc<Provider>> = Vec::new();
    let mut last_error = None;
    let mut served = false;

    while let Some(provider) = entrypoints.peek_untried(model, &tried) {
        tried.push(provider.clone());
        let started = Instant::now();
        let result = attempt(state, call, &provider, &writer).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(first_byte) => {
                debug!(
                    model,
                    provider = %provider.describe(),
                    first_byte_ms = first_byte.as_millis() as u64,
                    "Provider answered"
                );
                metrics.record_attempt(model, true);
                state.spawn_provider_stats(provider.id(), true, first_byte.as_millis() as i64);
                served = true;
                break;
            }
            Err(AttemptError::ClientGone(e)) => {
                debug!(model, error = %e, "Client disconnected mid-response");
                metrics.record_attempt(model, true);
                state.spawn_provider_stats(provider.id(), true, elapsed_ms);
                served = true;
                break;
            }
            Err(AttemptError::AfterOutput(e)) => {
                warn!(
                    model,
                    provider = %provider.describe(),
                    error = %e,
                    "Upstream failed mid-stream, terminating response"
                );
                metrics.record_attempt(model, false);
                state.spawn_provider_stats(provider.id(), false, elapsed_ms);
                served = true;
                break;
            }
            Err(AttemptError::BeforeOutput(e)) => {
                warn!(
                    model,
                    provider = %provider.describe(),
                    attempt = tried.len(),
                    pool_size,
                    error = %e,
                    "Provider failed"
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

    let output_bytes = writer.bytes_written();
    let status = if served {
        if let Err(e) = writer.close().await {
            debug!(model, error = %e, "Failed to finish response");
        }
        200
    } else {
        drop(writer);
        let error = final_error(model, pool_size, tried.len(), last_error);
        warn!(model, attempts = tried.len(), error = %error, "Chat request failed");
        if let Err(e) = write_error(conn, &error).await {
            debug!(model, error = %e, "Client went away before the error response");
        }
        error.status_code()
    };

    state.spawn_key_traffic(&call.account, call.prompt.byte_len(), output_bytes, status == 200);
    status
}

/// Serve one chat-completions request; returns the status sent
pub async fn handle<W>(state: &GatewayState, request: &HttpRequest, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin + Send,
{
    let _active = state.metrics().chat_request();

    let prepared = match prepare(state, request).await {
        Ok(call) => ensure_providers(state, &call.model).await.map(|_| call),
        Err(error) => Err(error),
    };
    match prepared {
        Ok(call) => dispatch(state, &call, conn).await,
        Err(error) => {
            debug!(error = %error, "Chat request rejected");
            if let Err(e) = write_error(conn, &error).await {
                debug!(error = %e, "Client went away before the error response");
            }
            error.status_code()
        }
    }
}
