//! Worker pool lifecycle: spawn, supervise, drain.

use std::{sync::Arc, time::Duration};

use notifyd_core::{storage::Storage, Clock};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::OutboundClient,
    error::{DispatchError, Result},
    worker::{DispatchConfig, DispatchStats, DispatchWorker},
};

/// Supervised collection of dispatch workers.
///
/// All workers share one cancellation token; `shutdown_graceful` signals it
/// and joins every handle under a deadline. Dropping a pool with live
/// workers cancels them so tasks are never orphaned.
pub struct WorkerPool {
    storage: Storage,
    config: DispatchConfig,
    client: Arc<OutboundClient>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a pool with shared engine resources.
    pub fn new(
        storage: Storage,
        config: DispatchConfig,
        client: Arc<OutboundClient>,
        stats: Arc<RwLock<DispatchStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            client,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns the configured number of workers.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for spawn-time
    /// validation.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning dispatch workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = DispatchWorker::new(
                worker_id,
                self.storage.clone(),
                self.config.clone(),
                self.client.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            self.worker_handles.push(tokio::spawn(async move { worker.run().await }));
        }

        Ok(())
    }

    /// Signals cancellation and joins all workers within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` when workers fail to drain
    /// before the deadline.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_secs = timeout.as_secs(),
            "draining dispatch workers"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();

        let drain = async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker panicked during shutdown");
                }
            }

            let mut stats = stats.write().await;
            stats.active_workers = 0;
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("worker pool drained");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker drain timed out, in-flight attempts may be lost"
                );
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        }
    }

}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
            warn!(
                active_workers = active,
                "worker pool dropped without graceful shutdown, cancelling workers"
            );
        }
    }
}
