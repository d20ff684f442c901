//! Adaptive latency watcher.
//!
//! Ticks at the fast interval. Every provider is probed once per slow
//! interval; in between, only providers flagged problematic are re-probed,
//! until their stored record looks sound again.

use crate::health::{probe_providers, HealthCheckConfig};
use crate::shutdown::{shutdown_requested, ShutdownPhase};
use crate::state::GatewayState;
use gateway_config::HealthSettings;
use gateway_core::HealthCounters;
use gateway_providers::Provider;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Watcher cadence and thresholds
#[derive(Debug, Clone)]
pub struct LatencyWatcherConfig {
    /// Tick interval; problematic providers are re-probed this often
    pub fast_interval: Duration,
    /// Interval between full sweeps
    pub slow_interval: Duration,
    /// Stored latency at or above which a provider is problematic
    pub problematic_latency: Duration,
}

impl Default for LatencyWatcherConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(10),
            slow_interval: Duration::from_secs(300),
            problematic_latency: Duration::from_secs(10),
        }
    }
}

impl From<&HealthSettings> for LatencyWatcherConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            fast_interval: settings.fast_interval,
            slow_interval: settings.interval,
            problematic_latency: settings.problematic_latency,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether this tick was a full sweep
    pub full: bool,
    /// Providers probed
    pub probed: usize,
    /// Providers newly flagged
    pub detected: usize,
    /// Providers that left the problematic set
    pub recovered: usize,
}

/// Why a stored record counts as problematic, if it does
#[must_use]
pub fn problem_reason(counters: &HealthCounters, threshold: Duration) -> Option<String> {
    let threshold_ms = threshold.as_millis() as i64;
    if !counters.first_check_completed {
        Some("first check not completed".to_string())
    } else if !counters.healthy {
        Some("unhealthy".to_string())
    } else if counters.last_latency_ms <= 0 {
        Some("no latency recorded".to_string())
    } else if counters.last_latency_ms >= threshold_ms {
        Some(format!("latency {}ms", counters.last_latency_ms))
    } else {
        None
    }
}

/// Dual-cadence re-prober for slow or failing providers
pub struct LatencyWatcher {
    state: Arc<GatewayState>,
    config: LatencyWatcherConfig,
    probe_config: HealthCheckConfig,
    problematic: Mutex<HashMap<i64, String>>,
    last_full: Mutex<Option<Instant>>,
}

impl LatencyWatcher {
    /// Create a watcher; probes use `probe_config`
    #[must_use]
    pub fn new(
        state: Arc<GatewayState>,
        config: LatencyWatcherConfig,
        probe_config: HealthCheckConfig,
    ) -> Self {
        Self {
            state,
            config,
            probe_config,
            problematic: Mutex::new(HashMap::new()),
            last_full: Mutex::new(None),
        }
    }

    /// Providers currently flagged, sorted
    #[must_use]
    pub fn problematic_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.problematic.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn full_sweep_due(&self) -> bool {
        let mut last_full = self.last_full.lock();
        match *last_full {
            Some(at) if at.elapsed() < self.config.slow_interval => false,
            _ => {
                *last_full = Some(Instant::now());
                true
            }
        }
    }

    /// Run one tick
    ///
    /// A full sweep skips providers the health checker probed within the
    /// slow interval but still classifies them from their stored record.
    pub async fn tick(&self) -> TickReport {
        let full = self.full_sweep_due();
        let all = self.state.entrypoints().all_providers();
        let (providers, mut reviewed): (Vec<Arc<Provider>>, HashSet<i64>) = if full {
            let ledger = self.state.probes();
            let due = all
                .iter()
                .filter(|p| !ledger.is_fresh(p.id(), self.config.slow_interval))
                .cloned()
                .collect();
            (due, all.iter().map(|p| p.id()).collect())
        } else {
            let flagged = self.problematic.lock();
            let due = all
                .into_iter()
                .filter(|p| flagged.contains_key(&p.id()))
                .collect();
            (due, HashSet::new())
        };
        let mut report = TickReport {
            full,
            ..TickReport::default()
        };
        if providers.is_empty() && reviewed.is_empty() {
            return report;
        }

        if !providers.is_empty() {
            let results = probe_providers(&self.state, &self.probe_config, providers).await;
            report.probed = results.len();
            reviewed.extend(results.iter().map(|r| r.id));
        }

        let records = match self.state.store().active_providers().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to load provider records");
                return report;
            }
        };

        let mut flagged = self.problematic.lock();
        for record in records.iter().filter(|r| reviewed.contains(&r.id)) {
            let subject = format!("#{} {}", record.id, record.spec.describe());
            match (
                problem_reason(&record.counters, self.config.problematic_latency),
                flagged.contains_key(&record.id),
            ) {
                (Some(reason), false) => {
                    warn!(provider = %subject, reason = %reason, "Problematic provider detected");
                    flagged.insert(record.id, reason);
                    report.detected += 1;
                }
                (Some(reason), true) => {
                    flagged.insert(record.id, reason);
                }
                (None, true) => {
                    info!(provider = %subject, "Provider recovered");
                    flagged.remove(&record.id);
                    report.recovered += 1;
                }
                (None, false) => {}
            }
        }
        debug!(
            full,
            probed = report.probed,
            problematic = flagged.len(),
            "Latency watcher tick"
        );
        report
    }

    /// Tick at the fast interval until shutdown
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<ShutdownPhase>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.fast_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                fast_secs = self.config.fast_interval.as_secs(),
                slow_secs = self.config.slow_interval.as_secs(),
                "Latency watcher started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    () = shutdown_requested(&mut shutdown) => break,
                }
            }
            info!("Latency watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckManager;
    use crate::state::GatewayStateBuilder;
    use gateway_core::{MemoryStore, ProviderSpec, ProviderStore};
    use gateway_providers::testing::{Script, ScriptedFactory};
    use gateway_providers::ClientRegistry;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    async fn watcher() -> (LatencyWatcher, ScriptedFactory, i64) {
        let store = Arc::new(MemoryStore::new());
        let factory = ScriptedFactory::new()
            .with_script("fast", Script::default().sleep(ms(100)).content("Pong"))
            .with_script("flaky", Script::default().sleep(ms(12_000)).content("Pong"));
        store
            .upsert_provider(&ProviderSpec::new("m", "m", "scripted", "k").with_domain("fast"))
            .await
            .unwrap();
        let flaky = store
            .upsert_provider(&ProviderSpec::new("m", "m", "scripted", "k").with_domain("flaky"))
            .await
            .unwrap();
        let clients = ClientRegistry::new();
        clients.register("scripted", factory.clone());
        let state = GatewayStateBuilder::new(store)
            .with_clients(clients)
            .build()
            .unwrap();
        state.reload_providers().await.unwrap();
        let watcher = LatencyWatcher::new(
            Arc::new(state),
            LatencyWatcherConfig::default(),
            HealthCheckConfig::default(),
        );
        (watcher, factory, flaky.id)
    }

    #[test]
    fn test_problem_reasons() {
        let mut counters = HealthCounters::default();
        assert!(problem_reason(&counters, Duration::from_secs(10)).is_some());
        counters.record_probe(true, 250, None);
        assert_eq!(problem_reason(&counters, Duration::from_secs(10)), None);
        counters.record_probe(true, 10_000, None);
        assert_eq!(
            problem_reason(&counters, Duration::from_secs(10)).as_deref(),
            Some("latency 10000ms")
        );
        counters.record_probe(true, 0, None);
        assert!(problem_reason(&counters, Duration::from_secs(10)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_problematic_provider_lifecycle() {
        let (watcher, factory, flaky) = watcher().await;

        let first = watcher.tick().await;
        assert!(first.full);
        assert_eq!((first.probed, first.detected), (2, 1));
        assert_eq!(watcher.problematic_ids(), vec![flaky]);

        // Fast ticks re-probe only the flagged provider and log nothing new
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = watcher.tick().await;
        assert!(!second.full);
        assert_eq!((second.probed, second.detected, second.recovered), (1, 0, 0));
        assert_eq!(factory.calls("fast"), 1);

        factory.set_script("flaky", Script::default().sleep(ms(50)).content("Pong"));
        tokio::time::advance(Duration::from_secs(10)).await;
        let third = watcher.tick().await;
        assert_eq!((third.probed, third.recovered), (1, 1));
        assert!(watcher.problematic_ids().is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(watcher.tick().await.probed, 0);

        tokio::time::advance(Duration::from_secs(300)).await;
        let sweep = watcher.tick().await;
        assert!(sweep.full);
        assert_eq!(sweep.probed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_sweeps_share_probes() {
        let (watcher, factory, flaky) = watcher().await;
        factory.set_script("flaky", Script::refuse("connection refused"));
        let manager = HealthCheckManager::new(watcher.state.clone(), HealthCheckConfig::default());

        // Both loops fire at startup; whichever runs second finds fresh probes
        assert_eq!(watcher.tick().await.probed, 2);
        assert!(manager.check_all(false).await.is_empty());
        assert_eq!(factory.calls("flaky"), 1);
        let record = watcher.state.store().provider(flaky).await.unwrap().unwrap();
        assert_eq!(record.counters.consecutive_failures, 1);

        // The next slow sweep is taken by the checker, so the watcher only reviews
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(manager.check_all(false).await.len(), 2);
        let sweep = watcher.tick().await;
        assert!(sweep.full);
        assert_eq!(sweep.probed, 0);
        assert_eq!(watcher.problematic_ids(), vec![flaky]);
        assert_eq!(factory.calls("flaky"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checker_first_then_watcher_reviews() {
        let (watcher, factory, flaky) = watcher().await;
        let manager = HealthCheckManager::new(watcher.state.clone(), HealthCheckConfig::default());

        assert_eq!(manager.check_all(false).await.len(), 2);
        let first = watcher.tick().await;
        assert!(first.full);
        assert_eq!((first.probed, first.detected), (0, 1));
        assert_eq!(watcher.problematic_ids(), vec![flaky]);
        assert_eq!(factory.calls("fast"), 1);
    }
}
