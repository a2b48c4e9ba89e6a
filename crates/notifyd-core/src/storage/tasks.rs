//! Repository for notification task rows and state-machine transitions.
//!
//! Owns the atomic claim: across every worker in every replica, a task in
//! `running` is held by exactly one claimant. The claim selects eligible
//! rows with `FOR UPDATE SKIP LOCKED` and flips them to `running` inside a
//! single transaction, so concurrent claimants each receive a disjoint set.
//! Outcome transitions are guarded by `status = 'running'` so a concurrent
//! cancel wins and terminal states stay write-once.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{NewTask, NotificationTask, TaskId, TaskStatus},
};

const TASK_COLUMNS: &str = "id, task_id, partner_id, target_url, http_method, headers, body, \
                            idempotency_key, priority, status, next_attempt_at, max_attempts, \
                            attempt_count, success_condition, created_at, updated_at";

/// Repository for `notification_tasks`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new task in `pending` state, due immediately.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Duplicate` when `(partner_id, idempotency_key)`
    /// collides with an existing row.
    pub async fn create(&self, task: &NewTask, now: DateTime<Utc>) -> Result<i64> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO notification_tasks (
                task_id, partner_id, target_url, http_method, headers, body,
                idempotency_key, priority, status, next_attempt_at, max_attempts,
                attempt_count, success_condition, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, $12, $13, $13
            )
            RETURNING id
            ",
        )
        .bind(task.task_id.as_str())
        .bind(&task.partner_id)
        .bind(&task.target_url)
        .bind(task.http_method.to_string())
        .bind(sqlx::types::Json(&task.headers))
        .bind(&task.body)
        .bind(&task.idempotency_key)
        .bind(task.priority)
        .bind(TaskStatus::Pending.to_string())
        .bind(now)
        .bind(task.max_attempts)
        .bind(&task.success_condition)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Looks up a task by its external handle.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. Absence is `Ok(None)`.
    pub async fn find_by_task_id(&self, task_id: &TaskId) -> Result<Option<NotificationTask>> {
        let task = sqlx::query_as::<_, NotificationTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM notification_tasks WHERE task_id = $1"
        ))
        .bind(task_id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(task)
    }

    /// Looks up a task by its surrogate key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. Absence is `Ok(None)`.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<NotificationTask>> {
        let task = sqlx::query_as::<_, NotificationTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM notification_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(task)
    }

    /// Looks up a task by idempotency key within a partner's scope.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. Absence is `Ok(None)`.
    pub async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
        partner_id: &str,
    ) -> Result<Option<NotificationTask>> {
        let task = sqlx::query_as::<_, NotificationTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM notification_tasks \
             WHERE idempotency_key = $1 AND partner_id = $2"
        ))
        .bind(idempotency_key)
        .bind(partner_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(task)
    }

    /// Atomically claims up to `limit` due tasks for this caller.
    ///
    /// Eligible rows have status `pending` or `failed` and
    /// `next_attempt_at <= now`, preferred by `priority DESC,
    /// next_attempt_at ASC`. Within one transaction the eligible rows are
    /// row-locked with `FOR UPDATE SKIP LOCKED` (rows locked by concurrent
    /// claimants are skipped, not waited on) and flipped to `running`.
    /// Exactly the rows this caller now owns are returned; rows claimed by
    /// peer replicas can never leak into the result.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails; no rows change state in that
    /// case.
    pub async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationTask>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM notification_tasks
            WHERE status IN ('pending', 'failed')
              AND next_attempt_at <= $1
            ORDER BY priority DESC, next_attempt_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut tasks = sqlx::query_as::<_, NotificationTask>(&format!(
            "UPDATE notification_tasks \
             SET status = 'running', updated_at = $1 \
             WHERE id = ANY($2) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(now)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // UPDATE .. RETURNING does not preserve the selection order.
        tasks.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(a.next_attempt_at.cmp(&b.next_attempt_at))
        });

        Ok(tasks)
    }

    /// Terminal transition: `running` → `succeeded`.
    ///
    /// The status guard makes the write a no-op when a concurrent cancel
    /// already moved the task out of `running`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_succeeded(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE notification_tasks
            SET status = 'succeeded', updated_at = $1
            WHERE task_id = $2 AND status = 'running'
            ",
        )
        .bind(now)
        .bind(task_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal transition: `running` → `dead` after the attempt cap.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dead(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE notification_tasks
            SET status = 'dead', updated_at = $1
            WHERE task_id = $2 AND status = 'running'
            ",
        )
        .bind(now)
        .bind(task_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancels a task unless it already reached a terminal state.
    ///
    /// Returns `true` when the row transitioned, `false` when the task was
    /// already `succeeded`, `cancelled`, or `dead` (the caller turns that
    /// into a 400).
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_cancelled(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE notification_tasks
            SET status = 'cancelled', updated_at = $1
            WHERE task_id = $2 AND status IN ('pending', 'running', 'failed')
            ",
        )
        .bind(now)
        .bind(task_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Schedules a retry: `running` → `failed` with the next due time.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        task_id: &TaskId,
        new_attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE notification_tasks
            SET status = 'failed', attempt_count = $1, next_attempt_at = $2, updated_at = $3
            WHERE task_id = $4 AND status = 'running'
            ",
        )
        .bind(new_attempt_count)
        .bind(next_attempt_at)
        .bind(now)
        .bind(task_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns stuck `running` rows to eligibility.
    ///
    /// A holder that crashed after claiming leaves its tasks invisible to
    /// the due-work predicate. Rows whose `updated_at` (refreshed by the
    /// claim) is older than `older_than` go back to `failed` with
    /// `next_attempt_at = now`. The sweep takes the same row locks as the
    /// claim, so it can never race a live claimant.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn reap_stuck(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u64> {
        let threshold = now
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM notification_tasks
            WHERE status = 'running' AND updated_at < $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            UPDATE notification_tasks
            SET status = 'failed', next_attempt_at = $1, updated_at = $1
            WHERE id = ANY($2)
            ",
        )
        .bind(now)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }
}
