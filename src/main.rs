//! notifyd service entry point.
//!
//! Wires the subsystems together: configuration, database pool, schema
//! migration, the ingest HTTP server, the dispatch engine, and the reaper.
//! Startup failures (bad config, unreachable database, occupied port) abort
//! the process with a non-zero exit code; a signal-driven shutdown drains
//! the workers and exits zero.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use notifyd_api::Config;
use notifyd_core::{storage::Storage, RealClock};
use notifyd_dispatch::DispatchEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log.level);

    info!(
        dsn = %config.dsn_masked(),
        port = config.server.port,
        worker_concurrency = config.worker.concurrency,
        "starting notifyd"
    );

    let pool = create_database_pool(&config).await?;
    run_migrations(&pool).await?;
    info!("database ready");

    let storage = Storage::new(pool.clone());
    let clock = Arc::new(RealClock);
    let config = Arc::new(config);

    let mut engine =
        DispatchEngine::new(storage.clone(), config.to_dispatch_config(), clock.clone())?;
    engine.start().await?;

    let stats_handle = spawn_stats_logger(&engine);

    // The server future resolves once a shutdown signal arrives and
    // in-flight ingest requests have drained.
    let addr = config.server_addr();
    notifyd_api::start_server(storage, config, clock, addr)
        .await
        .context("HTTP server failed")?;

    info!("shutting down");
    stats_handle.abort();

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "dispatch engine did not drain cleanly");
    }

    pool.close().await;
    info!("notifyd stopped");
    Ok(())
}

/// Initializes tracing from the configured level, with `RUST_LOG` taking
/// precedence when set.
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects the pool, retrying briefly so a restarting database does not
/// kill the service at boot.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database.max_open_conns)
            .min_connections(config.database.max_idle_conns.min(config.database.max_open_conns))
            .max_lifetime(Duration::from_secs(config.database.conn_max_lifetime))
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database.dsn)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database pool after retries");
            },
        }
    }
}

/// Creates the two tables and their indexes if absent.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS notification_tasks (
            id BIGSERIAL PRIMARY KEY,
            task_id TEXT NOT NULL UNIQUE,
            partner_id TEXT NOT NULL,
            target_url TEXT NOT NULL,
            http_method TEXT NOT NULL DEFAULT 'POST',
            headers JSONB NOT NULL DEFAULT '{}'::jsonb,
            body BYTEA NOT NULL DEFAULT ''::bytea,
            idempotency_key TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            max_attempts INTEGER NOT NULL DEFAULT 3
                CHECK (max_attempts BETWEEN 1 AND 10),
            attempt_count INTEGER NOT NULL DEFAULT 0,
            success_condition TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create notification_tasks")?;

    sqlx::query(
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_notification_tasks_partner_idem
        ON notification_tasks (partner_id, idempotency_key)
        WHERE idempotency_key IS NOT NULL
        ",
    )
    .execute(pool)
    .await
    .context("failed to create idempotency index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_notification_tasks_due
        ON notification_tasks (status, next_attempt_at)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create due-work index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_notification_tasks_partner
        ON notification_tasks (partner_id)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create partner index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS notification_attempts (
            id BIGSERIAL PRIMARY KEY,
            task_id TEXT NOT NULL,
            attempt_no INTEGER NOT NULL,
            status TEXT NOT NULL,
            http_status_code INTEGER NOT NULL DEFAULT 0,
            error_code TEXT,
            error_message TEXT,
            latency_ms BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (task_id, attempt_no)
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create notification_attempts")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_notification_attempts_task
        ON notification_attempts (task_id)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create attempts task index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_notification_attempts_created
        ON notification_attempts (created_at)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create attempts created index")?;

    Ok(())
}

/// Logs a dispatcher stats line every 30 seconds.
fn spawn_stats_logger(engine: &DispatchEngine) -> tokio::task::JoinHandle<()> {
    let stats = engine.stats_handle();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await; // the first tick fires immediately

        loop {
            ticker.tick().await;
            let snapshot = stats.read().await.clone();
            info!(
                active_workers = snapshot.active_workers,
                tasks_processed = snapshot.tasks_processed,
                deliveries_succeeded = snapshot.deliveries_succeeded,
                retries_scheduled = snapshot.retries_scheduled,
                tasks_dead = snapshot.tasks_dead,
                tasks_reaped = snapshot.tasks_reaped,
                in_flight = snapshot.in_flight,
                "dispatch stats"
            );
        }
    })
}
