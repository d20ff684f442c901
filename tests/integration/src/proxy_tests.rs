//! Geocoding passthrough and web-search relay

use crate::*;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use gateway_server::TotpVerifier;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::Value;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const TRACE_ID: &str = "Trace-ID";
const OTP_HEADER: &str = "X-OTP-Auth";
const OTP_SECRET: &str = "shared-otp-secret";

fn current_otp_header() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let code = TotpVerifier::new(SecretString::new(OTP_SECRET.into()))
        .code_at(now)
        .unwrap();
    STANDARD.encode(code)
}

#[tokio::test]
async fn test_geocoding_substitutes_pool_key() {
    let amap = MockAmap::start().await;
    let balancer = TestBalancer::start(&TestConfig::new().with_amap(amap.base_url()).build()).await;

    let response = balancer
        .client
        .get(balancer.url("/amap/v3/geocode/geo?address=Beijing&key=caller-key"))
        .header(TRACE_ID, "trace-geo-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["geocodes"][0]["formatted_address"], "Beijing");

    let queries = amap.received_queries().await;
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("key=amap-pool-key"), "{}", queries[0]);
    assert!(!queries[0].contains("caller-key"));
    balancer.stop().await;
}

#[tokio::test]
async fn test_geocoding_for_paid_caller() {
    let amap = MockAmap::start().await;
    let config = TestConfig::new()
        .with_amap(amap.base_url())
        .without_free_users()
        .build();
    let balancer = TestBalancer::start(&config).await;

    let paid = balancer
        .get("/amap/v3/geocode/geo?address=Beijing", Some(TEST_KEY))
        .await;
    assert_eq!(paid.status(), 200);

    let free = balancer
        .client
        .get(balancer.url("/amap/v3/geocode/geo?address=Beijing"))
        .header(TRACE_ID, "trace-geo-2")
        .send()
        .await
        .unwrap();
    assert_eq!(free.status(), 403);
    balancer.stop().await;
}

#[tokio::test]
async fn test_geocoding_identity_errors() {
    let amap = MockAmap::start().await;
    let balancer = TestBalancer::start(&TestConfig::new().with_amap(amap.base_url()).build()).await;

    let anonymous = balancer.get("/amap/v3/geocode/geo?address=x", None).await;
    assert_eq!(anonymous.status(), 502);

    let unknown = balancer
        .get("/amap/v3/geocode/geo?address=x", Some("sk-unknown"))
        .await;
    assert_eq!(unknown.status(), 401);

    let posted = balancer
        .client
        .post(balancer.url("/amap/v3/geocode/geo"))
        .send()
        .await
        .unwrap();
    assert_eq!(posted.status(), 405);
    assert!(amap.received_queries().await.is_empty());
    balancer.stop().await;
}

#[tokio::test]
async fn test_geocoding_without_keys() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;
    let response = balancer
        .client
        .get(balancer.url("/amap/v3/geocode/geo?address=x"))
        .header(TRACE_ID, "trace-geo-3")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    balancer.stop().await;
}

#[tokio::test]
async fn test_web_search_relay() {
    let search = MockSearch::start(3).await;
    let config = TestConfig::new()
        .with_search_key("brave", search.base_url())
        .build();
    let balancer = TestBalancer::start(&config).await;

    // An empty searcher type falls back to the best stocked pool
    let response = balancer
        .client
        .post(balancer.url("/v1/web-search"))
        .header(TRACE_ID, "trace-search-1")
        .json(&search_body("rust async", ""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["searcher_type"], "brave");
    assert_eq!(body["total"], 3);
    assert_eq!(body["results"][0]["url"], "https://example.com/0");
    balancer.stop().await;
}

#[tokio::test]
async fn test_web_search_validation() {
    let search = MockSearch::start(1).await;
    let config = TestConfig::new()
        .with_search_key("brave", search.base_url())
        .build();
    let balancer = TestBalancer::start(&config).await;

    for (i, body) in [search_body("", "brave"), search_body("rust", "altavista")]
        .iter()
        .enumerate()
    {
        let response = balancer
            .client
            .post(balancer.url("/v1/web-search"))
            .header(TRACE_ID, format!("trace-invalid-{i}"))
            .json(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "body {body}");
    }
    balancer.stop().await;
}

#[tokio::test]
async fn test_web_search_without_keys() {
    let balancer = TestBalancer::start(&TestConfig::new().build()).await;
    let response = balancer
        .client
        .post(balancer.url("/v1/web-search"))
        .bearer_auth(TEST_KEY)
        .json(&search_body("rust", "brave"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert!(error_message(response).await.contains("no web search api keys"));
    balancer.stop().await;
}

#[tokio::test]
async fn test_web_search_one_time_code() {
    let search = MockSearch::start(2).await;
    let config = TestConfig::new()
        .with_search_key("brave", search.base_url())
        .with_otp_secret(OTP_SECRET)
        .build();
    let balancer = TestBalancer::start(&config).await;
    let send = |code: Option<String>| {
        let mut request = balancer
            .client
            .post(balancer.url("/v1/web-search"))
            .bearer_auth(TEST_KEY)
            .json(&search_body("rust", "brave"));
        if let Some(code) = code {
            request = request.header(OTP_HEADER, code);
        }
        request.send()
    };

    let missing = send(None).await.unwrap();
    assert_eq!(missing.status(), 401);
    assert_eq!(error_type(missing).await, "totp_auth_required");

    // "abcdef" decodes fine but is never a six digit code
    let wrong = send(Some(STANDARD.encode("abcdef"))).await.unwrap();
    assert_eq!(wrong.status(), 401);
    assert_eq!(error_type(wrong).await, "totp_auth_failed");

    let garbage = send(Some("%%%".to_string())).await.unwrap();
    assert_eq!(error_type(garbage).await, "totp_auth_failed");
    assert_eq!(search.calls().await, 0);

    let accepted = send(Some(current_otp_header())).await.unwrap();
    assert_eq!(accepted.status(), 200);
    assert_eq!(search.calls().await, 1);
    balancer.stop().await;
}

#[tokio::test]
async fn test_web_search_key_failover() {
    let broken = MockSearch::failing(429).await;
    let working = MockSearch::start(2).await;
    let config = TestConfig::new()
        .with_search_key("brave", broken.base_url())
        .with_search_key("brave", working.base_url())
        .build();
    let balancer = TestBalancer::start(&config).await;

    // Attempt order is random; keep searching until the broken key came up first
    let mut searches = 0;
    while broken.calls().await == 0 && searches < 20 {
        searches += 1;
        let response = balancer
            .client
            .post(balancer.url("/v1/web-search"))
            .bearer_auth(TEST_KEY)
            .json(&search_body("failover", "brave"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["total"], 2);
    }
    assert!(broken.calls().await >= 1, "broken key never tried");
    assert_eq!(working.calls().await, searches);
    balancer.stop().await;
}

#[tokio::test]
async fn test_web_search_every_key_failing() {
    let first = MockSearch::failing(500).await;
    let second = MockSearch::failing(401).await;
    let config = TestConfig::new()
        .with_search_key("brave", first.base_url())
        .with_search_key("brave", second.base_url())
        .build();
    let balancer = TestBalancer::start(&config).await;

    let response = balancer
        .client
        .post(balancer.url("/v1/web-search"))
        .bearer_auth(TEST_KEY)
        .json(&search_body("rust", "brave"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!((first.calls().await, second.calls().await), (1, 1));
    balancer.stop().await;
}

#[tokio::test]
async fn test_free_caller_cools_down_after_search() {
    let search = MockSearch::start(1).await;
    let config = TestConfig::new()
        .with_search_key("brave", search.base_url())
        .build();
    let balancer = TestBalancer::start(&config).await;
    let send = |trace: &'static str| {
        balancer
            .client
            .post(balancer.url("/v1/web-search"))
            .header(TRACE_ID, trace)
            .json(&search_body("rust", "brave"))
            .send()
    };

    assert_eq!(send("trace-cool-1").await.unwrap().status(), 200);

    // A success holds the same caller back for longer than the one second wait budget
    let started = Instant::now();
    let throttled = send("trace-cool-1").await.unwrap();
    assert_eq!(throttled.status(), 504);
    assert_eq!(error_type(throttled).await, "rate_limit_timeout");
    assert!(started.elapsed() >= Duration::from_millis(900));

    // Other callers are not affected
    assert_eq!(send("trace-cool-2").await.unwrap().status(), 200);
    assert_eq!(search.calls().await, 2);
    balancer.stop().await;
}
