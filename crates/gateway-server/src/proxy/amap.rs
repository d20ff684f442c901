//! Geocoding passthrough.
//!
//! `GET /amap/<path>?<query>` is forwarded to the geocoding upstream with a
//! key from the `amap` pool appended. Responses are relayed verbatim unless
//! the body reports a key-specific error, in which case the next key is
//! tried.

use super::{respond_error, throttle, with_key_failover};
use crate::auth::{resolve_identity, CallerIdentity};
use crate::http::{write_response, HttpRequest};
use crate::state::GatewayState;
use gateway_core::{GatewayError, GatewayResult, PoolKey, PoolKind};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tracing::debug;
use url::{form_urlencoded, Url};

/// Path prefix of the route
pub const ROUTE_PREFIX: &str = "/amap/";

/// `infocode` values that blame the key rather than the request
pub const KEY_ERROR_INFOCODES: [&str; 5] = ["10001", "10003", "10004", "10005", "10044"];

/// Upstream answer relayed to the caller
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    /// HTTP status
    pub status: u16,
    /// Content type
    pub content_type: String,
    /// Raw body
    pub body: Vec<u8>,
}

/// Key-error `infocode` reported by a response body, if any
///
/// Only bodies with `status == "0"` count.
#[must_use]
pub fn key_error_infocode(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let field = |name: &str| match value.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    if field("status")? != "0" {
        return None;
    }
    let infocode = field("infocode")?;
    KEY_ERROR_INFOCODES
        .contains(&infocode.as_str())
        .then_some(infocode)
}

/// Upstream URL for a caller path and query, with the pool key attached
///
/// Any `key` parameter supplied by the caller is dropped.
///
/// # Errors
/// Returns a validation error for an unusable base URL or path
pub fn upstream_url(base: &str, path: &str, query: Option<&str>, key: &str) -> GatewayResult<Url> {
    let raw = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let mut url = Url::parse(&raw)
        .map_err(|e| GatewayError::validation(format!("invalid amap url '{raw}': {e}"), None))?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(query) = query {
            for (name, value) in form_urlencoded::parse(query.as_bytes()) {
                if name != "key" {
                    pairs.append_pair(&name, &value);
                }
            }
        }
        pairs.append_pair("key", key);
    }
    Ok(url)
}

pub(crate) async fn call_upstream(http: &reqwest::Client, url: Url) -> GatewayResult<UpstreamReply> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| GatewayError::provider("amap", e.to_string(), None, true))?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::provider("amap", e.to_string(), Some(status), true))?
        .to_vec();
    if let Some(infocode) = key_error_infocode(&body) {
        return Err(GatewayError::provider(
            "amap",
            format!("key rejected with infocode {infocode}"),
            Some(status),
            true,
        ));
    }
    Ok(UpstreamReply {
        status,
        content_type,
        body,
    })
}

async fn forward(state: &GatewayState, request: &HttpRequest) -> GatewayResult<UpstreamReply> {
    let api_path = request
        .path
        .strip_prefix(ROUTE_PREFIX)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| GatewayError::validation("missing geocoding api path", None))?;

    let identity = resolve_identity(state, request, "amap", state.amap().allow_free_users).await?;
    throttle(state, state.geo_limiter(), &identity).await?;

    let keys = state.store().active_pool_keys(PoolKind::Amap, None).await?;
    let base = state.amap().base_url.clone();
    let http = state.http();
    let query = request.query.as_deref();

    let success = with_key_failover(state, "amap", keys, |key: &PoolKey| {
        let url = upstream_url(
            key.base_url.as_deref().unwrap_or(&base),
            api_path,
            query,
            key.api_key.expose_secret(),
        );
        async move { call_upstream(http, url?).await }
    })
    .await?;
    debug!(
        path = api_path,
        attempts = success.attempts,
        key = %success.key.masked(),
        "Geocoding request served"
    );

    let reply = success.value;
    if let CallerIdentity::Paid(_) = &identity {
        state.spawn_key_traffic(
            identity.account(),
            request.target.len() as u64,
            reply.body.len() as u64,
            true,
        );
    }
    Ok(reply)
}

/// Serve one geocoding request; returns the status sent
pub async fn handle<W>(state: &GatewayState, request: &HttpRequest, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin,
{
    match forward(state, request).await {
        Ok(reply) => {
            if let Err(e) =
                write_response(conn, reply.status, &reply.content_type, &[], &reply.body).await
            {
                debug!(error = %e, "Client went away before the geocoding response");
            }
            reply.status
        }
        Err(error) => respond_error(conn, "amap", request, &error).await,
    }
}
