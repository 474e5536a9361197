//! Graceful Shutdown
//!
//! Broadcasts the stop signal to the background tasks of a node (replication
//! channel, health monitor, snapshot manager, API server) and waits for them
//! to finish.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Shutdown coordinator for the tasks of one node.
#[derive(Clone)]
pub struct ShutdownController {
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown. Only the first call broadcasts.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("initiating graceful shutdown");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Register a background task to wait for in `drain`.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every tracked task, aborting the ones still running after
    /// `timeout`. Returns true when all of them stopped on their own.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut clean = true;

        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("{} stopped", name),
                Ok(Err(e)) => {
                    tracing::error!("{} task failed: {:?}", name, e);
                    clean = false;
                }
                Err(_) => {
                    tracing::warn!("{} did not stop in time, aborting", name);
                    handle.abort();
                    clean = false;
                }
            }
        }
        clean
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes on Ctrl+C or SIGTERM and triggers `controller`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let mut stop = controller.subscribe();
    if controller.is_shutdown() {
        return;
    }

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
        _ = stop.recv() => {}
    }

    controller.shutdown();
}
