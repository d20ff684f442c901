//! Shutdown coordination for the balancer.
//!
//! The coordinator broadcasts a [`ShutdownPhase`] that the accept loop and
//! the background monitors watch. Connection tasks hold a
//! [`ConnectionGuard`] so [`ShutdownCoordinator::drain`] can wait for them;
//! they are never aborted, their own I/O deadlines bound them.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Shutdown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// Listener closed, waiting for open connections
    Draining,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Shutdown coordinator shared by the balancer and its tasks
pub struct ShutdownCoordinator {
    phase: watch::Sender<ShutdownPhase>,
    triggered: AtomicBool,
    open_connections: AtomicU64,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator in the running phase
    #[must_use]
    pub fn new() -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            phase,
            triggered: AtomicBool::new(false),
            open_connections: AtomicU64::new(0),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether shutdown was triggered
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Current phase
    #[must_use]
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Open connections
    #[must_use]
    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Track a connection until the guard is dropped
    #[must_use]
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            coordinator: self.clone(),
        }
    }

    /// Register a background task to abort once draining is over
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.background_tasks.lock().push(handle);
    }

    /// Start shutting down; returns false if already triggered
    pub fn trigger(&self, reason: &str) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(reason, "Shutdown already triggered");
            return false;
        }
        info!(reason, "Initiating shutdown");
        self.set_phase(ShutdownPhase::Draining);
        true
    }

    /// Wait up to `grace` for open connections, then stop background tasks
    pub async fn drain(&self, grace: Duration) {
        if timeout(grace, self.wait_for_connections()).await.is_err() {
            warn!(
                remaining = self.open_connections(),
                "Grace period exceeded with connections still open"
            );
        }

        let tasks: Vec<_> = self.background_tasks.lock().drain(..).collect();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Stopping background tasks");
        }
        for handle in tasks {
            handle.abort();
        }
        self.set_phase(ShutdownPhase::Complete);
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        info!(phase = %phase, "Shutdown phase changed");
        self.phase.send_replace(phase);
    }

    async fn wait_for_connections(&self) {
        loop {
            if self.open_connections() == 0 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Resolves once the coordinator leaves the running phase or is dropped
pub async fn shutdown_requested(phase: &mut watch::Receiver<ShutdownPhase>) {
    if phase
        .wait_for(|phase| *phase != ShutdownPhase::Running)
        .await
        .is_err()
    {
        debug!("Shutdown coordinator dropped");
    }
}

/// Keeps a connection counted while alive
pub struct ConnectionGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.coordinator
            .open_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for Ctrl+C, SIGTERM, SIGINT or SIGQUIT and return the signal name
///
/// # Panics
/// Panics if signal handlers cannot be installed
#[allow(clippy::expect_used)]
pub async fn shutdown_signal() -> String {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        "ctrl+c"
    };

    #[cfg(unix)]
    let sigterm = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        "sigterm"
    };

    #[cfg(unix)]
    let sigquit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("failed to install SIGQUIT handler")
            .recv()
            .await;
        "sigquit"
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&str>();
    #[cfg(not(unix))]
    let sigquit = std::future::pending::<&str>();

    let signal_name = tokio::select! {
        name = ctrl_c => name,
        name = sigterm => name,
        name = sigquit => name,
    };

    info!(signal = signal_name, "Received shutdown signal");
    signal_name.to_string()
}
