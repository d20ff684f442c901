//! Routing, validation and model listing over real sockets

use crate::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[tokio::test]
async fn test_unknown_key_is_rejected() {
    let upstream = MockUpstream::replying(&["hi"]).await;
    let balancer = TestBalancer::start(&TestConfig::new().with_upstreams([upstream.base_url()]).build()).await;

    let response = balancer
        .chat(Some("sk-unknown"), &chat_body(TEST_MODEL, true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let reason = response.headers()["x-reason"].to_str().unwrap().to_string();
    assert!(reason.contains("invalid api key"), "{reason}");
    assert_eq!(upstream.calls().await, 0);
    balancer.stop().await;
}

#[tokio::test]
async fn test_missing_key_for_paid_model() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;
    let response = balancer.chat(None, &chat_body(TEST_MODEL, true)).send().await.unwrap();
    assert_eq!(response.status(), 401);
    assert!(error_message(response).await.contains("missing api key"));
    balancer.stop().await;
}

#[tokio::test]
async fn test_request_validation() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;
    let cases = [
        json!({"model": TEST_MODEL, "messages": []}),
        json!({"model": "", "messages": [{"role": "user", "content": "hi"}]}),
        json!({"model": TEST_MODEL, "messages": [{"role": "user", "content": ""}]}),
    ];
    for body in cases {
        let response = balancer.chat(Some(TEST_KEY), &body).send().await.unwrap();
        assert_eq!(response.status(), 400, "body {body}");
        let error: Value = response.json().await.unwrap();
        assert_eq!(error["error"]["type"], "invalid_request_error");
    }

    let garbage = balancer
        .client
        .post(balancer.url("/v1/chat/completions"))
        .bearer_auth(TEST_KEY)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 400);
    balancer.stop().await;
}

#[tokio::test]
async fn test_unknown_and_unserved_models() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;

    let ghost = balancer
        .chat(Some(TEST_KEY), &chat_body("ghost-model", true))
        .send()
        .await
        .unwrap();
    assert_eq!(ghost.status(), 404);

    let reserved = balancer
        .chat(Some(TEST_KEY), &chat_body(EMPTY_MODEL, true))
        .send()
        .await
        .unwrap();
    assert_eq!(reserved.status(), 404);
    assert!(error_message(reserved).await.contains("contact admin"));
    balancer.stop().await;
}

#[tokio::test]
async fn test_model_listing() {
    let free = MockUpstream::replying(&["hi"]).await;
    let config = TestConfig::new()
        .with_free_upstreams([free.base_url()])
        .build();
    let balancer = TestBalancer::start(&config).await;

    let anonymous: Value = balancer.get("/v1/models", None).await.json().await.unwrap();
    let ids: Vec<&str> = anonymous["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(anonymous["object"], "list");
    assert_eq!(ids, vec![FREE_MODEL]);

    let paid: Value = balancer
        .get("/v1/models", Some(TEST_KEY))
        .await
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = paid["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec![TEST_MODEL, FREE_MODEL, EMPTY_MODEL]);

    let rejected = balancer.get("/v1/models", Some("sk-unknown")).await;
    assert_eq!(rejected.status(), 401);
    balancer.stop().await;
}

#[tokio::test]
async fn test_routing_errors() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;

    let missing = balancer.get("/v2/anything", None).await;
    assert_eq!(missing.status(), 404);

    let wrong_method = balancer.get("/v1/chat/completions", None).await;
    assert_eq!(wrong_method.status(), 405);
    assert_eq!(wrong_method.headers()["allow"], "POST");

    let malformed = balancer.raw(b"BROKEN\r\n\r\n").await;
    assert!(malformed.starts_with("HTTP/1.1 400"), "{malformed}");
    balancer.stop().await;
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;
    // Reading to EOF orders the count before the scrape
    let missing = balancer.raw(b"GET /nowhere HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(missing.starts_with("HTTP/1.1 404"));
    let text = balancer.get("/metrics", None).await.text().await.unwrap();
    assert!(text.contains("not_found"), "{text}");
    balancer.stop().await;
}
