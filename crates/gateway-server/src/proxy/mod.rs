//! Auxiliary proxies: geocoding passthrough and web-search relay.
//!
//! Both routes authenticate the caller first, then run a shuffled failover
//! over a key pool from the store: healthy keys first, then active keys
//! marked unhealthy. Per-key outcomes are recorded in the background.

pub mod amap;
pub mod searchers;
pub mod web_search;

use crate::auth::CallerIdentity;
use crate::http::{write_error, HttpRequest};
use crate::state::GatewayState;
use gateway_core::{GatewayError, GatewayResult, PoolKey};
use gateway_resilience::{FailoverSuccess, KeyPoolFailover, RateLimiter};
use std::future::Future;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

/// Attempt order for a pool: healthy keys shuffled, then unhealthy ones shuffled
pub(crate) fn attempt_order(target: &str, keys: Vec<PoolKey>) -> KeyPoolFailover<PoolKey> {
    KeyPoolFailover::new(target, keys)
        .shuffled_in_tiers(&mut rand::thread_rng(), |key| key.counters.healthy)
}

/// Run `call` over the pool in [`attempt_order`], recording every attempt
pub(crate) async fn with_key_failover<T, F, Fut>(
    state: &GatewayState,
    target: &str,
    keys: Vec<PoolKey>,
    call: F,
) -> GatewayResult<FailoverSuccess<PoolKey, T>>
where
    F: FnMut(&PoolKey) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    attempt_order(target, keys)
        .run(call, |attempt| {
            if let Some(error) = attempt.error {
                debug!(target_pool = target, key = %attempt.key.masked(), error = %error, "Pool key failed");
            }
            state.spawn_pool_key_stats(
                attempt.key.id,
                attempt.success,
                attempt.latency.as_millis() as i64,
            );
        })
        .await
}

/// Make a free caller wait its turn; paid callers pass straight through
pub(crate) async fn throttle(
    state: &GatewayState,
    limiter: &RateLimiter,
    identity: &CallerIdentity,
) -> GatewayResult<()> {
    if let CallerIdentity::Free { trace_id } = identity {
        limiter.wait(trace_id, state.options().rate_limit_wait).await?;
    }
    Ok(())
}

/// Write an error response for a proxy route and return its status
pub(crate) async fn respond_error<W>(
    conn: &mut W,
    route: &str,
    request: &HttpRequest,
    error: &GatewayError,
) -> u16
where
    W: AsyncWrite + Unpin,
{
    if error.is_client_error() {
        debug!(route, path = %request.path, error = %error, "Proxy request rejected");
    } else {
        warn!(route, path = %request.path, error = %error, "Proxy request failed");
    }
    if let Err(e) = write_error(conn, error).await {
        debug!(route, error = %e, "Client went away before the error response");
    }
    error.status_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::PoolKind;

    fn key(id: i64, healthy: bool) -> PoolKey {
        let mut key = PoolKey::new(id, PoolKind::WebSearch, "brave", format!("key-{id}"));
        key.counters.healthy = healthy;
        key
    }

    #[test]
    fn test_unhealthy_keys_are_tried_last() {
        for _ in 0..20 {
            let keys = vec![key(1, false), key(2, true), key(3, false), key(4, true)];
            let order: Vec<i64> = attempt_order("web_search/brave", keys)
                .keys()
                .iter()
                .map(|k| k.id)
                .collect();
            let mut healthy = order[..2].to_vec();
            healthy.sort_unstable();
            assert_eq!(healthy, vec![2, 4], "{order:?}");
        }
    }

    #[test]
    fn test_all_unhealthy_pool_is_still_tried() {
        let order = attempt_order("amap", vec![key(1, false), key(2, false)]);
        assert_eq!(order.len(), 2);
    }
}
