//! Per-identity request pacing.
//!
//! The limiter never rejects outright: a caller that arrives too early is
//! made to wait, and only gets a [`GatewayError::RateLimitTimeout`] if the
//! wait would run past its deadline.
//!
//! State is created lazily per identity with an atomic create-if-absent on a
//! `DashMap`, then guarded by that identity's own mutex, so unrelated
//! identities never contend. A sweeper task evicts identities that have been
//! idle longer than the retention window.

use dashmap::DashMap;
use gateway_core::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Pacing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Minimum interval between two requests of an identity
    Simple {
        /// Minimum spacing
        min_interval: Duration,
    },
    /// Minimum interval plus a cooldown after a reported success
    Cooldown {
        /// Minimum spacing
        min_interval: Duration,
        /// Extra spacing for the request following a success
        cooldown: Duration,
    },
}

impl RateLimitPolicy {
    /// One second between requests
    #[must_use]
    pub fn simple() -> Self {
        Self::Simple {
            min_interval: Duration::from_secs(1),
        }
    }

    /// One second between requests, three after a success
    #[must_use]
    pub fn cooldown() -> Self {
        Self::Cooldown {
            min_interval: Duration::from_secs(1),
            cooldown: Duration::from_secs(3),
        }
    }

    fn min_interval(&self) -> Duration {
        match self {
            Self::Simple { min_interval } | Self::Cooldown { min_interval, .. } => *min_interval,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Pacing policy
    pub policy: RateLimitPolicy,
    /// How often idle identities are evicted
    pub sweep_interval: Duration,
    /// Idle time after which an identity is forgotten
    pub retention: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::simple(),
            sweep_interval: Duration::from_secs(60),
            retention: Duration::from_secs(5 * 60),
        }
    }
}

impl RateLimiterConfig {
    /// Configuration with the given policy
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Set the sweep interval
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the retention window
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

#[derive(Debug)]
struct IdentityState {
    last_request: Option<Instant>,
    last_success: Option<Instant>,
    cooldown_pending: bool,
    last_touched: Instant,
}

impl IdentityState {
    fn new(now: Instant) -> Self {
        Self {
            last_request: None,
            last_success: None,
            cooldown_pending: false,
            last_touched: now,
        }
    }

    /// Time still to wait, or `None` if the request may proceed now
    fn pending_delay(&self, policy: &RateLimitPolicy, now: Instant) -> Option<Duration> {
        let mut ready_at = self
            .last_request
            .map(|t| t + policy.min_interval());
        if let RateLimitPolicy::Cooldown { cooldown, .. } = policy {
            if self.cooldown_pending {
                if let Some(success) = self.last_success {
                    let cooled = success + *cooldown;
                    ready_at = Some(ready_at.map_or(cooled, |r| r.max(cooled)));
                }
            }
        }
        ready_at
            .filter(|ready| *ready > now)
            .map(|ready| ready - now)
    }
}

/// Per-identity pacing gate
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    identities: DashMap<String, Arc<Mutex<IdentityState>>>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl RateLimiter {
    /// Create a limiter; call [`RateLimiter::start_sweeper`] to enable eviction
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            config,
            identities: DashMap::new(),
            stop_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Limiter name for logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active policy
    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        self.config.policy
    }

    /// Identities currently tracked
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.identities.len()
    }

    fn state(&self, identity: &str) -> Arc<Mutex<IdentityState>> {
        self.identities
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(IdentityState::new(Instant::now()))))
            .value()
            .clone()
    }

    /// Admit the request now, or return how long to wait
    pub fn try_acquire(&self, identity: &str) -> Result<(), Duration> {
        let state = self.state(identity);
        let mut state = state.lock();
        let now = Instant::now();
        state.last_touched = now;
        if let Some(delay) = state.pending_delay(&self.config.policy, now) {
            return Err(delay);
        }
        state.last_request = Some(now);
        state.cooldown_pending = false;
        Ok(())
    }

    /// Wait until the identity may proceed
    ///
    /// Sleeps the remaining delta and re-checks in a loop so concurrent
    /// requests of the same identity are spaced correctly.
    ///
    /// # Errors
    /// Returns [`GatewayError::RateLimitTimeout`] once `deadline` has passed
    pub async fn wait(&self, identity: &str, deadline: Duration) -> GatewayResult<()> {
        let started = Instant::now();
        loop {
            let delay = match self.try_acquire(identity) {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };
            let waited = started.elapsed();
            if waited >= deadline {
                debug!(limiter = %self.name, identity = %identity, "Rate limit wait timed out");
                return Err(GatewayError::RateLimitTimeout {
                    identity: identity.to_string(),
                    waited,
                });
            }
            debug!(
                limiter = %self.name,
                identity = %identity,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, waiting"
            );
            sleep(delay.min(deadline - waited)).await;
        }
    }

    /// Report a successful request; the next one from this identity cools down
    pub fn record_success(&self, identity: &str) {
        let state = self.state(identity);
        let mut state = state.lock();
        let now = Instant::now();
        state.last_success = Some(now);
        state.cooldown_pending = true;
        state.last_touched = now;
    }

    /// Evict identities idle for longer than the retention window
    pub fn sweep(&self) -> usize {
        let retention = self.config.retention;
        let before = self.identities.len();
        self.identities
            .retain(|_, state| state.lock().last_touched.elapsed() <= retention);
        let evicted = before.saturating_sub(self.identities.len());
        if evicted > 0 {
            debug!(limiter = %self.name, evicted, "Evicted idle rate limit identities");
        }
        evicted
    }

    /// Spawn the periodic sweep; it runs until [`RateLimiter::stop`]
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                    _ = stop_rx.changed() => {
                        info!(limiter = %limiter.name, "Rate limiter sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweeper; further calls are no-ops
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }
}
