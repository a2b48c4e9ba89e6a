//! Repository for the append-only attempt journal.
//!
//! Attempt rows are never mutated. The ordinal is derived from the task row
//! inside the recording transaction (`SELECT ... FOR UPDATE`, insert, bump
//! `attempt_count`), never from a separate `COUNT(*)`, so concurrent reapers
//! cannot produce duplicate or gapped ordinals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AttemptOutcome, NotificationAttempt, TaskId, TaskStatus},
};

/// Repository for `notification_attempts`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Journals one attempt and advances the task's attempt counter.
    ///
    /// Within a single transaction: locks the task row, derives
    /// `attempt_no = attempt_count + 1`, inserts the attempt, and bumps
    /// `attempt_count` so the counter always equals the journal length.
    ///
    /// Returns `Some(attempt_no)` on success, or `None` when the task is no
    /// longer `running` (a concurrent cancel won the race): terminal tasks
    /// accrue no further journal rows.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` when the task does not exist, or a
    /// database error if the transaction fails. Nothing is written in
    /// either case.
    pub async fn record(
        &self,
        task_id: &TaskId,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        let mut tx = self.pool.begin().await?;

        let (attempt_count, status): (i32, TaskStatus) = sqlx::query_as(
            r"
            SELECT attempt_count, status FROM notification_tasks
            WHERE task_id = $1
            FOR UPDATE
            ",
        )
        .bind(task_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if status != TaskStatus::Running {
            tx.rollback().await?;
            return Ok(None);
        }

        let attempt_no = attempt_count + 1;

        sqlx::query(
            r"
            INSERT INTO notification_attempts (
                task_id, attempt_no, status, http_status_code,
                error_code, error_message, latency_ms, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(task_id.as_str())
        .bind(attempt_no)
        .bind(outcome.status.to_string())
        .bind(outcome.http_status_code)
        .bind(&outcome.error_code)
        .bind(&outcome.error_message)
        .bind(outcome.latency_ms)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            UPDATE notification_tasks
            SET attempt_count = $1, updated_at = $2
            WHERE task_id = $3
            ",
        )
        .bind(attempt_no)
        .bind(now)
        .bind(task_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(attempt_no))
    }

    /// All attempts for a task, ordered by ordinal ascending.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_task_id(&self, task_id: &TaskId) -> Result<Vec<NotificationAttempt>> {
        let attempts = sqlx::query_as::<_, NotificationAttempt>(
            r"
            SELECT id, task_id, attempt_no, status, http_status_code,
                   error_code, error_message, latency_ms, created_at
            FROM notification_attempts
            WHERE task_id = $1
            ORDER BY attempt_no ASC
            ",
        )
        .bind(task_id.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Number of journaled attempts for a task.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self, task_id: &TaskId) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notification_attempts WHERE task_id = $1")
                .bind(task_id.as_str())
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }
}
