//! Listener, accept loop and lifecycle.

use crate::health::{HealthCheckConfig, HealthCheckManager};
use crate::latency::{LatencyWatcher, LatencyWatcherConfig};
use crate::router::RequestRouter;
use crate::shutdown::{shutdown_requested, shutdown_signal, ShutdownCoordinator};
use crate::state::GatewayState;
use gateway_config::GatewayConfig;
use gateway_core::{GatewayError, GatewayResult, ProviderStore};
use gateway_providers::ClientRegistry;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// How long open connections may finish after a shutdown signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The load balancer: owns the listening socket and the background loops
pub struct Balancer {
    state: Arc<GatewayState>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Balancer {
    /// Bind the listening socket
    ///
    /// # Errors
    /// Returns [`GatewayError::Bind`] when the address is taken or invalid
    pub async fn bind(state: Arc<GatewayState>, address: &str) -> GatewayResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| GatewayError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Balancer listening");
        Ok(Self {
            state,
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        })
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state
    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Shutdown coordinator
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Start the health checker, the latency watcher and the limiter sweeps
    pub fn start_monitoring(&self, health: HealthCheckConfig, latency: LatencyWatcherConfig) {
        let manager = Arc::new(HealthCheckManager::new(self.state.clone(), health.clone()));
        self.shutdown
            .register_task(manager.start(self.shutdown.subscribe()));

        let watcher = Arc::new(LatencyWatcher::new(self.state.clone(), latency, health));
        self.shutdown
            .register_task(watcher.start(self.shutdown.subscribe()));

        self.start_sweepers();
    }

    /// Start only the rate-limiter sweeps
    pub fn start_sweepers(&self) {
        self.shutdown
            .register_task(self.state.geo_limiter().start_sweeper());
        self.shutdown
            .register_task(self.state.search_limiter().start_sweeper());
    }

    /// Accept connections until [`Balancer::stop`] is called
    ///
    /// Every connection is served on its own task. Accept errors are logged
    /// and the loop keeps going.
    ///
    /// # Errors
    /// Returns an error if the balancer is already running or has stopped
    pub async fn run(&self) -> GatewayResult<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| GatewayError::internal("balancer listener already taken"))?;
        let router = RequestRouter::new(self.state.clone());
        let mut phase = self.shutdown.subscribe();

        loop {
            tokio::select! {
                () = shutdown_requested(&mut phase) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let router = router.clone();
                        let tracked = self.shutdown.connection_guard();
                        let active = self.state.metrics().connection();
                        tokio::spawn(async move {
                            let _tracked = tracked;
                            let _active = active;
                            debug!(peer = %peer, "Connection accepted");
                            router.handle(stream).await;
                            debug!(peer = %peer, "Connection closed");
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        drop(listener);
        info!(address = %self.local_addr, "Listener closed");
        Ok(())
    }

    /// Stop accepting; returns false if already stopped
    ///
    /// Open connections are left to finish under their own deadlines.
    pub fn stop(&self) -> bool {
        if !self.shutdown.trigger("stop requested") {
            return false;
        }
        self.state.geo_limiter().stop();
        self.state.search_limiter().stop();
        // A balancer stopped before running never accepts
        drop(self.listener.lock().take());
        true
    }

    /// Stop, then wait up to `grace` for open connections
    pub async fn shutdown_gracefully(&self, grace: Duration) {
        self.stop();
        self.shutdown.drain(grace).await;
    }
}

/// Run a balancer for `config` until a shutdown signal arrives
///
/// # Errors
/// Returns startup errors: store seeding, binding the listener
pub async fn serve(config: &GatewayConfig, store: Arc<dyn ProviderStore>) -> GatewayResult<()> {
    let state =
        GatewayState::from_config(config, store, ClientRegistry::with_defaults()).await?;
    let balancer = Arc::new(Balancer::bind(Arc::new(state), &config.server.listen).await?);
    if config.health.enabled {
        balancer.start_monitoring((&config.health).into(), (&config.health).into());
    } else {
        info!("Health monitoring disabled");
        balancer.start_sweepers();
    }

    let signals = {
        let balancer = balancer.clone();
        tokio::spawn(async move {
            let signal = shutdown_signal().await;
            info!(signal = %signal, "Stopping balancer");
            balancer.stop();
        })
    };
    let result = balancer.run().await;
    signals.abort();
    balancer.shutdown_gracefully(SHUTDOWN_GRACE).await;
    result
}
