//! Chat completions and embeddings end to end: streaming, buffering and failover

use crate::*;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::Value;

#[tokio::test]
async fn test_streaming_response() {
    let upstream = MockUpstream::replying(&["Hello", ", ", "world"]).await;
    let balancer = TestBalancer::start(&TestConfig::new().with_upstreams([upstream.base_url()]).build()).await;

    let response = balancer
        .chat(Some(TEST_KEY), &chat_body(TEST_MODEL, true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["transfer-encoding"], "chunked");

    let body = response.text().await.unwrap();
    assert_eq!(streamed_content(&body), "Hello, world");
    let payloads = sse_payloads(&body);
    assert_eq!(payloads.iter().filter(|p| p.as_str() == "[DONE]").count(), 1);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["model"], TEST_MODEL);

    let records = balancer.wait_for_observations(TEST_MODEL, 1).await;
    assert_eq!(records[0].counters.success_count, 1);
    assert_eq!(upstream.calls().await, 1);
    balancer.stop().await;
}

#[tokio::test]
async fn test_buffered_response() {
    let upstream = MockUpstream::replying(&["Hel", "lo"]).await;
    let balancer = TestBalancer::start(&TestConfig::new().with_upstreams([upstream.base_url()]).build()).await;

    let response = balancer
        .chat(Some(TEST_KEY), &chat_body(TEST_MODEL, false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    balancer.stop().await;
}

#[tokio::test]
async fn test_failover_to_working_upstream() {
    let down = MockUpstream::failing(503).await;
    let silent = MockUpstream::replying(&[]).await;
    let up = MockUpstream::replying(&["recovered"]).await;
    let config = TestConfig::new()
        .with_upstreams([down.base_url(), silent.base_url(), up.base_url()])
        .build();
    let balancer = TestBalancer::start(&config).await;

    let response = balancer
        .chat(Some(TEST_KEY), &chat_body(TEST_MODEL, true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(streamed_content(&response.text().await.unwrap()), "recovered");
    assert_eq!(up.calls().await, 1);
    assert!(down.calls().await <= 1);
    assert!(silent.calls().await <= 1);

    let attempts = 1 + down.calls().await + silent.calls().await;
    let records = balancer
        .wait_for_observations(TEST_MODEL, attempts as u64)
        .await;
    let successes: u64 = records.iter().map(|r| r.counters.success_count).sum();
    let failures: u64 = records.iter().map(|r| r.counters.failure_count).sum();
    assert_eq!(successes, 1);
    assert_eq!(failures as usize, attempts - 1);
    balancer.stop().await;
}

#[tokio::test]
async fn test_single_unreachable_upstream() {
    let config = TestConfig::new()
        .with_upstreams([unreachable_base_url()])
        .build();
    let balancer = TestBalancer::start(&config).await;

    let response = balancer
        .chat(Some(TEST_KEY), &chat_body(TEST_MODEL, true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_error");

    let records = balancer.wait_for_observations(TEST_MODEL, 1).await;
    assert_eq!(records[0].counters.failure_count, 1);
    assert_eq!(records[0].counters.success_count, 0);
    balancer.stop().await;
}

#[tokio::test]
async fn test_every_upstream_failing() {
    let first = MockUpstream::failing(500).await;
    let second = MockUpstream::failing(503).await;
    let config = TestConfig::new()
        .with_upstreams([first.base_url(), second.base_url()])
        .build();
    let balancer = TestBalancer::start(&config).await;

    let response = balancer
        .chat(Some(TEST_KEY), &chat_body(TEST_MODEL, false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert!(response.headers().contains_key("x-reason"));
    assert!(first.calls().await >= 1);
    assert!(second.calls().await >= 1);
    balancer.stop().await;
}

#[tokio::test]
async fn test_free_model_without_key() {
    let upstream = MockUpstream::replying(&["free answer"]).await;
    let config = TestConfig::new()
        .with_free_upstreams([upstream.base_url()])
        .build();
    let balancer = TestBalancer::start(&config).await;

    let response = balancer
        .chat(None, &chat_body(FREE_MODEL, true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(streamed_content(&response.text().await.unwrap()), "free answer");
    balancer.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_the_pool() {
    let upstream = MockUpstream::replying(&["ok"]).await;
    let balancer = TestBalancer::start(&TestConfig::new().with_upstreams([upstream.base_url()]).build()).await;

    let requests = (0..8).map(|_| {
        balancer
            .chat(Some(TEST_KEY), &chat_body(TEST_MODEL, true))
            .send()
    });
    for response in join_all(requests).await {
        let response = response.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(streamed_content(&response.text().await.unwrap()), "ok");
    }
    assert_eq!(upstream.calls().await, 8);
    balancer.stop().await;
}

#[tokio::test]
async fn test_embeddings_with_failover() {
    let down = MockUpstream::failing(503).await;
    let up = MockUpstream::start().await;
    up.mock_embedding(&[0.5, 0.25]).await;
    let config = TestConfig::new()
        .with_upstreams([down.base_url(), up.base_url()])
        .build();
    let balancer = TestBalancer::start(&config).await;

    let response = balancer
        .client
        .post(balancer.url("/v1/embeddings"))
        .bearer_auth(TEST_KEY)
        .json(&embedding_body(TEST_MODEL, serde_json::json!(["first", "second"])))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["model"], TEST_MODEL);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][1]["embedding"][0], 0.5);
    assert_eq!(body["usage"]["prompt_tokens"], 11);
    assert_eq!(up.calls().await, 2);
    assert!(down.calls().await <= 1);
    balancer.stop().await;
}

#[tokio::test]
async fn test_embeddings_require_a_key() {
    let up = MockUpstream::start().await;
    up.mock_embedding(&[1.0]).await;
    let balancer = TestBalancer::start(&TestConfig::new().with_upstreams([up.base_url()]).build()).await;

    let response = balancer
        .client
        .post(balancer.url("/v1/embeddings"))
        .json(&embedding_body(TEST_MODEL, serde_json::json!("hello")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(up.calls().await, 0);
    balancer.stop().await;
}
