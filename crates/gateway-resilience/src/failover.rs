//! Key-pool failover.
//!
//! A [`KeyPoolFailover`] tries every key of a pool once, in random order,
//! until one call succeeds. Keys can be split into a preferred tier that is
//! tried first, each tier shuffled on its own. Each attempt is reported to a callback so the
//! caller can record per-key statistics without blocking the request.

use gateway_core::{GatewayError, GatewayResult};
use rand::seq::SliceRandom;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One finished attempt against a key
#[derive(Debug)]
pub struct Attempt<'a, K> {
    /// Key that was tried
    pub key: &'a K,
    /// Whether the call succeeded
    pub success: bool,
    /// Call latency
    pub latency: Duration,
    /// Failure, if any
    pub error: Option<&'a GatewayError>,
}

/// Successful failover result
#[derive(Debug)]
pub struct FailoverSuccess<K, T> {
    /// Key that answered
    pub key: K,
    /// Value produced by the call
    pub value: T,
    /// Number of attempts made, including the successful one
    pub attempts: usize,
}

/// Shuffled sequential failover over a pool of keys
#[derive(Debug, Clone)]
pub struct KeyPoolFailover<K> {
    target: String,
    keys: Vec<K>,
}

impl<K> KeyPoolFailover<K> {
    /// Pool for `target` in the given order
    pub fn new(target: impl Into<String>, keys: Vec<K>) -> Self {
        Self {
            target: target.into(),
            keys,
        }
    }

    /// Shuffle preferred keys and the rest separately, preferred first
    #[must_use]
    pub fn shuffled_in_tiers<R, P>(self, rng: &mut R, preferred: P) -> Self
    where
        R: Rng + ?Sized,
        P: Fn(&K) -> bool,
    {
        let (mut first, mut rest): (Vec<K>, Vec<K>) = self.keys.into_iter().partition(|k| preferred(k));
        first.shuffle(rng);
        rest.shuffle(rng);
        first.append(&mut rest);
        Self {
            target: self.target,
            keys: first,
        }
    }

    /// Keys in attempt order
    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Number of keys in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Try each key until one succeeds
    ///
    /// Retryable errors move on to the next key. A non-retryable error is
    /// not the key's fault and is returned immediately.
    ///
    /// # Errors
    /// [`GatewayError::Unavailable`] for an empty pool,
    /// [`GatewayError::ProvidersExhausted`] once every key has failed, or
    /// the first non-retryable error
    pub async fn run<T, F, Fut, R>(self, mut call: F, mut report: R) -> GatewayResult<FailoverSuccess<K, T>>
    where
        F: FnMut(&K) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
        R: FnMut(Attempt<'_, K>),
    {
        if self.keys.is_empty() {
            return Err(GatewayError::unavailable(format!(
                "no active keys for {}",
                self.target
            )));
        }

        let mut last_error = None;
        let mut attempts = 0usize;
        for key in self.keys {
            attempts += 1;
            let started = Instant::now();
            let result = call(&key).await;
            let latency = started.elapsed();
            match result {
                Ok(value) => {
                    report(Attempt {
                        key: &key,
                        success: true,
                        latency,
                        error: None,
                    });
                    debug!(target_pool = %self.target, attempts, "Key pool call succeeded");
                    return Ok(FailoverSuccess {
                        key,
                        value,
                        attempts,
                    });
                }
                Err(error) if error.is_retryable() => {
                    report(Attempt {
                        key: &key,
                        success: false,
                        latency,
                        error: Some(&error),
                    });
                    warn!(
                        target_pool = %self.target,
                        attempt = attempts,
                        error = %error,
                        "Key failed, trying next"
                    );
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(GatewayError::exhausted(&self.target, attempts, last))
    }
}
