//! Web-search relay.

use super::searchers::{SearchQuery, SearchResult};
use super::{respond_error, throttle, with_key_failover};
use crate::auth::{check_otp, resolve_identity, CallerIdentity};
use crate::http::{write_json, HttpRequest};
use crate::state::GatewayState;
use gateway_core::{GatewayError, GatewayResult, PoolKey, PoolKind};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tracing::{debug, info};

/// Route path
pub const ROUTE_PATH: &str = "/v1/web-search";

const MAX_RESULTS_LIMIT: u32 = 50;

fn default_ten() -> u32 {
    10
}

fn default_page() -> u32 {
    1
}

/// Search request body
#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchRequest {
    /// Query text
    #[serde(default)]
    pub query: String,
    /// Requested searcher; empty picks the best stocked one
    #[serde(default)]
    pub searcher_type: String,
    /// Results returned at most
    #[serde(default = "default_ten")]
    pub max_results: u32,
    /// One-based page
    #[serde(default = "default_page")]
    pub page: u32,
    /// Results requested from the backend
    #[serde(default = "default_ten")]
    pub page_size: u32,
}

impl WebSearchRequest {
    /// Parse and check a request body
    ///
    /// # Errors
    /// Returns a validation error for empty or invalid bodies, an empty
    /// query, an unknown searcher or out-of-range sizes
    pub fn parse(body: &[u8], supported: impl Fn(&str) -> bool) -> GatewayResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(GatewayError::validation("request body is empty", None));
        }
        let mut request: Self = serde_json::from_slice(body).map_err(|e| {
            GatewayError::validation(format!("invalid request body: {e}"), Some("body".into()))
        })?;

        request.query = request.query.trim().to_string();
        request.searcher_type = request.searcher_type.trim().to_lowercase();
        if request.query.is_empty() {
            return Err(GatewayError::validation("query is required", Some("query".into())));
        }
        if !request.searcher_type.is_empty() && !supported(&request.searcher_type) {
            return Err(GatewayError::validation(
                format!("unsupported searcher_type '{}'", request.searcher_type),
                Some("searcher_type".into()),
            ));
        }
        if request.max_results == 0 {
            request.max_results = default_ten();
        }
        if request.page == 0 {
            request.page = default_page();
        }
        if request.page_size == 0 {
            request.page_size = default_ten();
        }
        if request.max_results > MAX_RESULTS_LIMIT || request.page_size > MAX_RESULTS_LIMIT {
            return Err(GatewayError::validation(
                format!("max_results and page_size must not exceed {MAX_RESULTS_LIMIT}"),
                None,
            ));
        }
        Ok(request)
    }
}

/// Search response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchResponse {
    /// Hits, at most `max_results`
    pub results: Vec<SearchResult>,
    /// Number of hits returned
    pub total: usize,
    /// Searcher that answered
    pub searcher_type: String,
}

/// Sub-type to fall back to: the supported one with the most active keys,
/// ties broken alphabetically
#[must_use]
pub fn pick_fallback(counts: &[(String, usize)], supported: impl Fn(&str) -> bool) -> Option<String> {
    counts
        .iter()
        .filter(|(name, count)| *count > 0 && supported(name))
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(name, _)| name.clone())
}

async fn resolve_keys(state: &GatewayState, requested: &str) -> GatewayResult<(String, Vec<PoolKey>)> {
    let store = state.store();
    if !requested.is_empty() {
        let keys = store
            .active_pool_keys(PoolKind::WebSearch, Some(requested))
            .await?;
        if !keys.is_empty() {
            return Ok((requested.to_string(), keys));
        }
        info!(requested, "No keys for requested searcher, falling back");
    }

    let counts = store.pool_key_counts(PoolKind::WebSearch).await?;
    let fallback = pick_fallback(&counts, |name| state.searchers().supports(name))
        .ok_or_else(|| GatewayError::unavailable("no web search api keys available"))?;
    let keys = store
        .active_pool_keys(PoolKind::WebSearch, Some(&fallback))
        .await?;
    if keys.is_empty() {
        return Err(GatewayError::unavailable("no web search api keys available"));
    }
    Ok((fallback, keys))
}

async fn search(state: &GatewayState, request: &HttpRequest) -> GatewayResult<WebSearchResponse> {
    let body = WebSearchRequest::parse(&request.body, |name| state.searchers().supports(name))?;

    let identity = resolve_identity(
        state,
        request,
        "web-search",
        state.web_search().allow_free_users,
    )
    .await?;
    throttle(state, state.search_limiter(), &identity).await?;
    if let Some(verifier) = state.otp() {
        check_otp(verifier, request, "web-search")?;
    }

    let (searcher_type, keys) = resolve_keys(state, &body.searcher_type).await?;
    let searcher = state.searchers().get(&searcher_type).ok_or_else(|| {
        GatewayError::unavailable(format!("searcher {searcher_type} is not available"))
    })?;
    let query = SearchQuery {
        query: body.query.clone(),
        page: body.page,
        page_size: body.page_size,
    };

    let http = state.http();
    let backend = searcher.as_ref();
    let query_ref = &query;
    let target = format!("web_search/{searcher_type}");
    let success = with_key_failover(state, &target, keys, |key: &PoolKey| {
        let key = key.clone();
        async move { backend.search(http, &key, query_ref).await }
    })
    .await?;

    let mut results = success.value;
    results.truncate(body.max_results as usize);
    debug!(
        searcher = %searcher_type,
        attempts = success.attempts,
        results = results.len(),
        "Web search served"
    );

    let response = WebSearchResponse {
        total: results.len(),
        results,
        searcher_type,
    };

    match &identity {
        CallerIdentity::Free { trace_id } => state.search_limiter().record_success(trace_id),
        CallerIdentity::Paid(key) => {
            let output = serde_json::to_vec(&response).map_or(0, |v| v.len() as u64);
            state.spawn_key_traffic(
                &key.key,
                request.body.len() as u64,
                output + state.web_search().traffic_per_search,
                true,
            );
        }
    }
    Ok(response)
}

/// Serve one web-search request; returns the status sent
pub async fn handle<W>(state: &GatewayState, request: &HttpRequest, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin,
{
    match search(state, request).await {
        Ok(response) => {
            if let Err(e) = write_json(conn, 200, &response).await {
                debug!(error = %e, "Client went away before the search response");
            }
            200
        }
        Err(error) => respond_error(conn, "web-search", request, &error).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(name: &str) -> bool {
        matches!(name, "brave" | "tavily" | "chatglm" | "bocha")
    }

    #[test]
    fn test_parse_defaults() {
        let request = WebSearchRequest::parse(br#"{"query":" rust "}"#, known).unwrap();
        assert_eq!(request.query, "rust");
        assert_eq!(request.max_results, 10);
        assert_eq!(request.page, 1);
        assert_eq!(request.page_size, 10);
        assert!(request.searcher_type.is_empty());
    }

    #[test]
    fn test_parse_rejections() {
        for body in [
            b"".as_slice(),
            b"{",
            br#"{"query":""}"#,
            br#"{"query":"x","searcher_type":"google"}"#,
            br#"{"query":"x","max_results":500}"#,
        ] {
            let err = WebSearchRequest::parse(body, known).unwrap_err();
            assert_eq!(err.status_code(), 400);
            assert_eq!(err.error_type(), "invalid_request_error");
        }
        let ok = WebSearchRequest::parse(br#"{"query":"x","searcher_type":"Brave"}"#, known).unwrap();
        assert_eq!(ok.searcher_type, "brave");
    }

    #[test]
    fn test_fallback_prefers_most_keys() {
        let counts = vec![
            ("bocha".to_string(), 2),
            ("brave".to_string(), 3),
            ("tavily".to_string(), 3),
            ("unknown".to_string(), 9),
        ];
        assert_eq!(pick_fallback(&counts, known), Some("brave".to_string()));
        assert_eq!(pick_fallback(&[("brave".to_string(), 0)], known), None);
        assert_eq!(pick_fallback(&[], known), None);
    }
}
