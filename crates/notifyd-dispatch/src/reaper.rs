//! Recovery sweep for tasks stranded in `running` by crashed holders.
//!
//! A replica that dies after claiming leaves its tasks invisible to the
//! due-work predicate. The reaper periodically returns `running` rows older
//! than a threshold to `failed` with an immediate due time, taking the same
//! row locks as the claim so it can never race a live worker.

use std::{sync::Arc, time::Duration};

use notifyd_core::{storage::Storage, Clock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::worker::DispatchStats;

/// Periodic sweep returning stuck `running` tasks to eligibility.
pub struct Reaper {
    storage: Storage,
    reap_after: Duration,
    interval: Duration,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Reaper {
    /// Creates a reaper over the given store.
    pub fn new(
        storage: Storage,
        reap_after: Duration,
        interval: Duration,
        stats: Arc<RwLock<DispatchStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, reap_after, interval, stats, cancellation_token, clock }
    }

    /// Sweeps until cancelled.
    pub async fn run(&self) {
        info!(
            reap_after_secs = self.reap_after.as_secs(),
            interval_secs = self.interval.as_secs(),
            "reaper starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }

            match self.storage.tasks.reap_stuck(self.reap_after, self.clock.now_utc()).await {
                Ok(0) => {},
                Ok(reaped) => {
                    let mut stats = self.stats.write().await;
                    stats.tasks_reaped += reaped;
                    drop(stats);

                    warn!(reaped, "returned stuck running tasks to eligibility");
                },
                Err(e) => {
                    error!(error = %e, "reap sweep failed");
                },
            }
        }

        info!("reaper stopped");
    }
}
