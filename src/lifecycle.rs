//! Process-wide cancellation and the graceful shutdown sequence.
//!
//! Every recording session gets a child of the root token, so an interrupt
//! cancels all of them at once while a single session ending never touches
//! its siblings. The terminating flag is separate from the token: finalize
//! decisions must tell "this session ended" apart from "the process is
//! going down".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time in-flight sinks get to flush after an interrupt.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Handle to the shutdown state shared by drivers, sessions, and sinks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    root: CancellationToken,
    terminating: Arc<AtomicBool>,
    grace_complete: CancellationToken,
    grace: Duration,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            root: CancellationToken::new(),
            terminating: Arc::new(AtomicBool::new(false)),
            grace_complete: CancellationToken::new(),
            grace,
        }
    }

    /// Root token; cancelled once an interrupt is received.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Fresh token for one recording attempt.
    pub fn session_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Whether the process is inside its shutdown grace window.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Run the shutdown sequence: mark terminating, cancel every session,
    /// wait out the grace period, then release [`Shutdown::grace_complete`].
    ///
    /// Only the first call runs the sequence; later calls wait for it.
    pub async fn trigger(&self) {
        if self.terminating.swap(true, Ordering::AcqRel) {
            self.grace_complete.cancelled().await;
            return;
        }

        tracing::info!(grace = ?self.grace, "Terminating after grace period");
        self.root.cancel();
        tokio::time::sleep(self.grace).await;
        self.grace_complete.cancel();
        tracing::debug!("Grace period complete");
    }

    /// Resolves once the grace period after an interrupt has elapsed.
    pub async fn grace_complete(&self) {
        self.grace_complete.cancelled().await;
    }

    /// Spawn a task that runs [`Shutdown::trigger`] on SIGINT or SIGTERM.
    ///
    /// The task exits quietly if the root token is cancelled some other way.
    pub fn spawn_signal_watcher(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if shutdown_signal(shutdown.root.clone()).await {
                shutdown.trigger().await;
            }
        })
    }
}

/// Wait for SIGINT or SIGTERM. Returns `false` if `cancel` fired first.
async fn shutdown_signal(cancel: CancellationToken) -> bool {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => return false,
    }

    tracing::info!("Shutdown signal received");
    true
}
