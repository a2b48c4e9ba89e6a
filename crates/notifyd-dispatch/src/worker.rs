//! Delivery engine: claims due tasks, executes HTTP calls, journals every
//! attempt, and drives the task state machine.
//!
//! Each worker is an independent poll loop. Workers across all replicas
//! coordinate only through the store's atomic claim, so adding replicas
//! scales delivery without any extra coordination medium.

use std::{collections::HashMap, sync::Arc, time::Duration};

use notifyd_core::{
    storage::Storage, AttemptOutcome, AttemptStatus, Clock, NotificationTask, TaskId,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, OutboundClient},
    error::{classify_status, DispatchError, Result},
    headers,
    reaper::Reaper,
    retry::RetryPolicy,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent worker loops per replica.
    pub worker_count: usize,

    /// Maximum tasks claimed per poll tick.
    pub batch_size: usize,

    /// How often an idle worker polls for due work.
    pub poll_interval: Duration,

    /// Retry timing policy.
    pub retry_policy: RetryPolicy,

    /// Outbound client limits.
    pub client_config: ClientConfig,

    /// Maximum time to wait for workers to drain on shutdown. Kept longer
    /// than the request timeout so in-flight attempts normally journal.
    pub shutdown_timeout: Duration,

    /// Age at which a `running` task counts as abandoned by a dead holder.
    pub reap_after: Duration,

    /// How often the reaper sweeps.
    pub reap_interval: Duration,

    /// Sensitive-header bindings, `NAME` → real value. Read-only after
    /// startup.
    pub sensitive_bindings: HashMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(15),
            reap_after: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            sensitive_bindings: HashMap::new(),
        }
    }
}

/// Counters for the periodic stats log line.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// Workers currently spawned.
    pub active_workers: usize,
    /// Tasks pulled through the pipeline since startup.
    pub tasks_processed: u64,
    /// Attempts classified as success.
    pub deliveries_succeeded: u64,
    /// Failures that were rescheduled.
    pub retries_scheduled: u64,
    /// Tasks that exhausted their attempt cap.
    pub tasks_dead: u64,
    /// HTTP calls currently in flight.
    pub in_flight: u64,
    /// Stuck tasks returned to eligibility by the reaper.
    pub tasks_reaped: u64,
}

/// Delivery engine owning the worker pool and the reaper.
pub struct DispatchEngine {
    storage: Storage,
    config: DispatchConfig,
    client: Arc<OutboundClient>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    reaper_handle: Option<tokio::task::JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl DispatchEngine {
    /// Creates an engine over the given store.
    ///
    /// # Errors
    ///
    /// Returns error when the outbound client cannot be built.
    pub fn new(storage: Storage, config: DispatchConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Arc::new(OutboundClient::new(config.client_config.clone())?);

        Ok(Self {
            storage,
            config,
            client,
            stats: Arc::new(RwLock::new(DispatchStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            reaper_handle: None,
            clock,
        })
    }

    /// Spawns the worker pool and the reaper, returning immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting dispatch engine"
        );

        let mut pool = WorkerPool::new(
            self.storage.clone(),
            self.config.clone(),
            self.client.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        pool.spawn_workers().await?;
        self.worker_pool = Some(pool);

        let reaper = Reaper::new(
            self.storage.clone(),
            self.config.reap_after,
            self.config.reap_interval,
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        self.reaper_handle = Some(tokio::spawn(async move { reaper.run().await }));

        info!("dispatch engine started");
        Ok(())
    }

    /// Signals shutdown and waits for workers and the reaper to drain.
    ///
    /// # Errors
    ///
    /// Returns error when the drain exceeds the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down dispatch engine");

        self.cancellation_token.cancel();

        if let Some(handle) = self.reaper_handle.take() {
            // The reaper exits promptly on cancellation; a failed join only
            // means it panicked, which is already logged by the runtime.
            let _ = handle.await;
        }

        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        }

        Ok(())
    }

    /// Shared handle to the live counters, for periodic reporting.
    pub fn stats_handle(&self) -> Arc<RwLock<DispatchStats>> {
        self.stats.clone()
    }
}

/// One worker loop: claim a batch, deliver each task, journal, transition.
pub struct DispatchWorker {
    id: usize,
    storage: Storage,
    config: DispatchConfig,
    client: Arc<OutboundClient>,
    stats: Arc<RwLock<DispatchStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DispatchWorker {
    /// Creates a worker with shared engine resources.
    pub fn new(
        id: usize,
        storage: Storage,
        config: DispatchConfig,
        client: Arc<OutboundClient>,
        stats: Arc<RwLock<DispatchStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, config, client, stats, cancellation_token, clock }
    }

    /// Runs the claim/deliver loop until cancelled.
    pub async fn run(&self) {
        info!(worker_id = self.id, "dispatch worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {
                    // Claimed a non-empty batch; poll again immediately in
                    // case more work is due.
                },
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "batch processing failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "dispatch worker stopped");
    }

    /// Claims and processes one batch. Returns how many tasks were claimed.
    async fn process_batch(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let tasks = self.storage.tasks.claim_due(self.config.batch_size, now).await?;
        let claimed = tasks.len();

        if claimed > 0 {
            debug!(worker_id = self.id, claimed, "claimed due tasks");
        }

        for task in tasks {
            if self.cancellation_token.is_cancelled() {
                // Unprocessed claims stay `running` and fall to the reaper.
                warn!(
                    worker_id = self.id,
                    task_id = %task.task_id,
                    "shutdown during batch, leaving task for the reaper"
                );
                break;
            }

            self.process_task(&task).await;
        }

        Ok(claimed)
    }

    /// Delivers one claimed task and advances its state machine.
    ///
    /// Remote failures never bubble out of here: they become attempt rows
    /// and retry/dead transitions. A store failure while recording leaves
    /// the task `running` for the reaper.
    pub async fn process_task(&self, task: &NotificationTask) {
        let attempt_no = task.attempt_count + 1;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        let rendered =
            headers::render(task.headers(), &self.config.sensitive_bindings, task.task_id.as_str());

        let result = self
            .client
            .send(task.http_method, &task.target_url, &rendered, task.body_bytes())
            .await;

        let (success, outcome) = Self::build_outcome(&result);

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.tasks_processed += 1;
        }

        let now = self.clock.now_utc();
        match self.storage.attempts.record(&task.task_id, &outcome, now).await {
            Ok(Some(recorded_no)) => {
                if recorded_no != attempt_no {
                    // Counter drifted from the claimed snapshot; the journal
                    // transaction is authoritative.
                    warn!(
                        worker_id = self.id,
                        task_id = %task.task_id,
                        expected = attempt_no,
                        recorded = recorded_no,
                        "attempt ordinal diverged from claimed snapshot"
                    );
                }
                self.apply_outcome(task, recorded_no, success, &outcome).await;
            },
            Ok(None) => {
                info!(
                    worker_id = self.id,
                    task_id = %task.task_id,
                    "task left running state mid-flight, dropping attempt"
                );
            },
            Err(e) => {
                error!(
                    worker_id = self.id,
                    task_id = %task.task_id,
                    error = %e,
                    "failed to journal attempt, leaving task for the reaper"
                );
            },
        }
    }

    /// Classifies the call result into (success, journal row).
    fn build_outcome(
        result: &std::result::Result<crate::client::OutboundResponse, DispatchError>,
    ) -> (bool, AttemptOutcome) {
        match result {
            Ok(response) => {
                let success = classify_status(response.status_code);
                let (error_code, error_message) = if success {
                    (None, None)
                } else {
                    let err = DispatchError::status(response.status_code);
                    let body = String::from_utf8_lossy(&response.body);
                    (
                        Some(err.error_code()),
                        Some(headers::truncate_for_log(&body, crate::ERROR_MESSAGE_LIMIT)),
                    )
                };

                (success, AttemptOutcome {
                    status: AttemptStatus::Sent,
                    http_status_code: i32::from(response.status_code),
                    error_code,
                    error_message,
                    latency_ms: i64::try_from(response.latency.as_millis()).unwrap_or(i64::MAX),
                })
            },
            Err(e) => (false, AttemptOutcome {
                status: AttemptStatus::Failed,
                http_status_code: 0,
                error_code: Some(e.error_code()),
                error_message: Some(headers::truncate_for_log(
                    &e.to_string(),
                    crate::ERROR_MESSAGE_LIMIT,
                )),
                latency_ms: 0,
            }),
        }
    }

    /// Applies the state transition for a journaled attempt.
    async fn apply_outcome(
        &self,
        task: &NotificationTask,
        attempt_no: i32,
        success: bool,
        outcome: &AttemptOutcome,
    ) {
        let now = self.clock.now_utc();

        if success {
            match self.storage.tasks.mark_succeeded(&task.task_id, now).await {
                Ok(true) => {
                    let mut stats = self.stats.write().await;
                    stats.deliveries_succeeded += 1;
                    drop(stats);

                    info!(
                        worker_id = self.id,
                        task_id = %task.task_id,
                        partner_id = %task.partner_id,
                        attempt_no,
                        status_code = outcome.http_status_code,
                        latency_ms = outcome.latency_ms,
                        "notification delivered"
                    );
                },
                Ok(false) => {
                    info!(
                        worker_id = self.id,
                        task_id = %task.task_id,
                        "task no longer running, success transition skipped"
                    );
                },
                Err(e) => {
                    error!(
                        worker_id = self.id,
                        task_id = %task.task_id,
                        error = %e,
                        "failed to mark task succeeded"
                    );
                },
            }
            return;
        }

        if attempt_no < task.max_attempts {
            self.schedule_retry(&task.task_id, task, attempt_no, outcome, now).await;
        } else {
            match self.storage.tasks.mark_dead(&task.task_id, now).await {
                Ok(true) => {
                    let mut stats = self.stats.write().await;
                    stats.tasks_dead += 1;
                    drop(stats);

                    warn!(
                        worker_id = self.id,
                        task_id = %task.task_id,
                        partner_id = %task.partner_id,
                        attempt_no,
                        max_attempts = task.max_attempts,
                        "attempt cap exhausted, task dead"
                    );
                },
                Ok(false) => {},
                Err(e) => {
                    error!(
                        worker_id = self.id,
                        task_id = %task.task_id,
                        error = %e,
                        "failed to mark task dead"
                    );
                },
            }
        }
    }

    async fn schedule_retry(
        &self,
        task_id: &TaskId,
        task: &NotificationTask,
        attempt_no: i32,
        outcome: &AttemptOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        // Backoff grows from the pre-increment attempt count: the first
        // retry waits base, the second 2x base.
        let next_attempt_at = self.config.retry_policy.next_attempt_at(task.attempt_count, now);

        match self.storage.tasks.schedule_retry(task_id, attempt_no, next_attempt_at, now).await {
            Ok(true) => {
                let mut stats = self.stats.write().await;
                stats.retries_scheduled += 1;
                drop(stats);

                info!(
                    worker_id = self.id,
                    task_id = %task_id,
                    partner_id = %task.partner_id,
                    attempt_no,
                    max_attempts = task.max_attempts,
                    error_code = outcome.error_code.as_deref().unwrap_or(""),
                    next_attempt_at = %next_attempt_at,
                    "delivery failed, retry scheduled"
                );
            },
            Ok(false) => {
                info!(
                    worker_id = self.id,
                    task_id = %task_id,
                    "task no longer running, retry not scheduled"
                );
            },
            Err(e) => {
                error!(
                    worker_id = self.id,
                    task_id = %task_id,
                    error = %e,
                    "failed to schedule retry"
                );
            },
        }
    }
}
