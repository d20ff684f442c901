//! Per-connection request dispatch.

use crate::http::{error_body, read_request, write_json, write_response, HttpRequest, RequestError};
use crate::proxy::{amap, web_search};
use crate::state::GatewayState;
use crate::{chat, embeddings, models};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Reads one request per connection and hands it to its route
#[derive(Clone)]
pub struct RequestRouter {
    state: Arc<GatewayState>,
}

impl RequestRouter {
    /// Create a router over shared state
    #[must_use]
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// Shared state
    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Serve one connection: read a request, answer it, close
    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, mut conn) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let options = self.state.options();

        let read = timeout(
            options.read_timeout,
            read_request(&mut reader, options.max_body_bytes),
        )
        .await;
        let request = match read {
            Ok(Ok(request)) => request,
            Ok(Err(RequestError::Closed | RequestError::Io(_))) => return,
            Ok(Err(e)) => {
                let status = e.status_code().unwrap_or(400);
                debug!(error = %e, status, "Rejected unreadable request");
                let body = error_body(&e.to_string(), "invalid_request_error");
                if let Err(e) = write_json(&mut conn, status, &body).await {
                    debug!(error = %e, "Client went away before the rejection");
                }
                self.state.metrics().record_request("invalid", status);
                close(&mut conn).await;
                return;
            }
            Err(_) => {
                debug!("Timed out reading request");
                return;
            }
        };

        let (route, status) = self.dispatch(&request, &mut conn).await;
        debug!(
            method = %request.method,
            path = %request.path,
            route,
            status,
            "Request served"
        );
        self.state.metrics().record_request(route, status);
        close(&mut conn).await;
    }

    /// Route a parsed request; returns the route label and status sent
    pub async fn dispatch<W>(&self, request: &HttpRequest, conn: &mut W) -> (&'static str, u16)
    where
        W: AsyncWrite + Unpin + Send,
    {
        let state = self.state.as_ref();
        let method = request.method.as_str();
        let path = request.path.as_str();

        match path {
            chat::ROUTE_PATH => {
                if method != "POST" {
                    return ("chat", method_not_allowed(conn, "POST").await);
                }
                ("chat", chat::handle(state, request, conn).await)
            }
            embeddings::ROUTE_PATH => {
                if method != "POST" {
                    return ("embeddings", method_not_allowed(conn, "POST").await);
                }
                ("embeddings", embeddings::handle(state, request, conn).await)
            }
            models::ROUTE_PATH => {
                if method != "GET" {
                    return ("models", method_not_allowed(conn, "GET").await);
                }
                ("models", models::handle(state, request, conn).await)
            }
            web_search::ROUTE_PATH => {
                if method != "POST" {
                    return ("web_search", method_not_allowed(conn, "POST").await);
                }
                ("web_search", web_search::handle(state, request, conn).await)
            }
            "/metrics" => {
                if method != "GET" {
                    return ("metrics", method_not_allowed(conn, "GET").await);
                }
                ("metrics", self.metrics(conn).await)
            }
            _ if path.starts_with(amap::ROUTE_PREFIX) => {
                if method != "GET" {
                    return ("amap", method_not_allowed(conn, "GET").await);
                }
                ("amap", amap::handle(state, request, conn).await)
            }
            _ => {
                let body = error_body(&format!("not found: {path}"), "invalid_request_error");
                if let Err(e) = write_json(conn, 404, &body).await {
                    debug!(error = %e, "Client went away before the not-found response");
                }
                ("not_found", 404)
            }
        }
    }

    async fn metrics<W>(&self, conn: &mut W) -> u16
    where
        W: AsyncWrite + Unpin,
    {
        let metrics = self.state.metrics();
        match metrics.gather() {
            Ok(text) => {
                let content_type = metrics.content_type();
                if let Err(e) = write_response(conn, 200, &content_type, &[], text.as_bytes()).await {
                    debug!(error = %e, "Client went away before the metrics");
                }
                200
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode metrics");
                let body = error_body("failed to encode metrics", "internal_error");
                if let Err(e) = write_json(conn, 500, &body).await {
                    debug!(error = %e, "Client went away before the error response");
                }
                500
            }
        }
    }
}

async fn method_not_allowed<W>(conn: &mut W, allow: &str) -> u16
where
    W: AsyncWrite + Unpin,
{
    let body = json!({
        "error": {
            "message": format!("method not allowed, use {allow}"),
            "type": "invalid_request_error",
        }
    });
    let payload = body.to_string();
    if let Err(e) = write_response(
        conn,
        405,
        "application/json",
        &[("Allow", allow)],
        payload.as_bytes(),
    )
    .await
    {
        debug!(error = %e, "Client went away before the method error");
    }
    405
}

async fn close<W>(conn: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = conn.shutdown().await {
        debug!(error = %e, "Failed to shut down connection");
    }
}
