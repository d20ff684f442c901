//! Model listing.

use crate::http::{write_error, write_json, HttpRequest};
use crate::state::GatewayState;
use gateway_core::{is_free_model, GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::io::AsyncWrite;
use tracing::debug;

/// Route path
pub const ROUTE_PATH: &str = "/v1/models";

/// One listed model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name
    pub id: String,
    /// Always `model`
    pub object: String,
    /// Unix timestamp of the listing
    pub created: i64,
    /// Always `aibalance`
    pub owned_by: String,
}

/// `GET /v1/models` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    /// Always `list`
    pub object: String,
    /// Visible models, sorted by name
    pub data: Vec<ModelInfo>,
}

/// Models visible to the caller: free models plus the key's allowed ones
///
/// # Errors
/// Returns `401` for an unknown bearer key
pub fn visible_models(state: &GatewayState, request: &HttpRequest) -> GatewayResult<ModelList> {
    let key = match request.bearer_token() {
        Some(token) => Some(
            state
                .keys()
                .get(token)
                .ok_or_else(|| GatewayError::authentication("invalid api key"))?,
        ),
        None => None,
    };

    let mut names: BTreeSet<String> = state
        .entrypoints()
        .model_names()
        .into_iter()
        .filter(|name| is_free_model(name))
        .collect();
    if let Some(key) = key {
        names.extend(key.allowed_models);
    }

    let created = chrono::Utc::now().timestamp();
    Ok(ModelList {
        object: "list".to_string(),
        data: names
            .into_iter()
            .map(|id| ModelInfo {
                id,
                object: "model".to_string(),
                created,
                owned_by: "aibalance".to_string(),
            })
            .collect(),
    })
}

/// Serve one listing request; returns the status sent
pub async fn handle<W>(state: &GatewayState, request: &HttpRequest, conn: &mut W) -> u16
where
    W: AsyncWrite + Unpin,
{
    let (status, result) = match visible_models(state, request) {
        Ok(list) => (200, write_json(conn, 200, &list).await),
        Err(error) => (error.status_code(), write_error(conn, &error).await),
    };
    if let Err(e) = result {
        debug!(error = %e, "Client went away before the model listing");
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GatewayStateBuilder;
    use gateway_core::{ApiKey, MemoryStore};
    use std::sync::Arc;

    fn request(key: Option<&str>) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            target: ROUTE_PATH.into(),
            path: ROUTE_PATH.into(),
            headers: key
                .map(|k| vec![("authorization".to_string(), format!("Bearer {k}"))])
                .unwrap_or_default(),
            ..HttpRequest::default()
        }
    }

    async fn state() -> GatewayState {
        let store = Arc::new(MemoryStore::new());
        store.add_api_key(ApiKey::new("sk-a", ["gpt-4o", "deepseek-r1"]), None);
        let state = GatewayStateBuilder::new(store).build().unwrap();
        state.entrypoints().create_model_entry("qwen-free");
        state.entrypoints().create_model_entry("gpt-4o");
        state.reload_keys().await.unwrap();
        state
    }

    fn ids(list: &ModelList) -> Vec<&str> {
        list.data.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_anonymous_sees_free_models() {
        let state = state().await;
        let list = visible_models(&state, &request(None)).unwrap();
        assert_eq!(list.object, "list");
        assert_eq!(ids(&list), vec!["qwen-free"]);
    }

    #[tokio::test]
    async fn test_key_sees_allowed_models() {
        let state = state().await;
        let list = visible_models(&state, &request(Some("sk-a"))).unwrap();
        assert_eq!(ids(&list), vec!["deepseek-r1", "gpt-4o", "qwen-free"]);
        assert!(list.data.iter().all(|m| m.object == "model"));
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let state = state().await;
        let mut out = Vec::new();
        assert_eq!(handle(&state, &request(Some("nope")), &mut out).await, 401);
        assert!(String::from_utf8_lossy(&out).contains("invalid api key"));
    }
}
