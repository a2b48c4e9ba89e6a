//! Notification submission, status, and cancel handlers.
//!
//! The submit path validates, applies the URL policy, deduplicates by
//! `(partner_id, idempotency_key)`, rewrites sensitive header values to
//! placeholders, and inserts the task `pending` and immediately due. The
//! insert race on the idempotency key is recovered by re-reading the row
//! that won.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use notifyd_core::{HttpMethod, NewTask, NotificationAttempt, NotificationTask, TaskId};
use notifyd_dispatch::headers::rewrite_sensitive;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::{policy, AppState};

/// Submission payload for `POST /v1/notify`.
#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    /// Tenancy and idempotency scope. Required.
    pub partner_id: String,

    /// Absolute target URL. Required.
    pub target_url: String,

    /// HTTP method, default POST.
    #[serde(default)]
    pub method: Option<String>,

    /// Request headers to send.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    /// Request body: a JSON string or any raw JSON value, stored verbatim.
    #[serde(default)]
    pub body: Option<serde_json::Value>,

    /// Idempotency key; the `Idempotency-Key` header is the fallback.
    #[serde(default)]
    pub idempotency_key: Option<String>,

    /// Claim-ordering priority.
    #[serde(default)]
    pub priority: Option<i32>,

    /// Attempt cap, 1..=10.
    #[serde(default)]
    pub max_attempts: Option<i32>,

    /// Reserved. Non-empty values are rejected until an evaluator exists.
    #[serde(default)]
    pub success_condition: Option<String>,
}

/// Response for a created or deduplicated submission.
#[derive(Debug, Serialize)]
pub struct CreateNotificationResponse {
    /// External task handle.
    pub task_id: String,
    /// Current task status.
    pub status: String,
}

/// Task snapshot for `GET /v1/notify/{task_id}`.
#[derive(Debug, Serialize)]
pub struct GetNotificationResponse {
    /// External task handle.
    pub task_id: String,
    /// Owning partner.
    pub partner_id: String,
    /// Delivery target.
    pub target_url: String,
    /// Outbound method.
    pub method: String,
    /// Current task status.
    pub status: String,
    /// Attempt cap.
    pub max_attempts: i32,
    /// Attempts journaled so far.
    pub attempt_count: i32,
    /// Next due time; present only while the task can still run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
    /// Submission time.
    pub created_at: String,
    /// Last mutation time.
    pub updated_at: String,
    /// Summary of the most recent attempt, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<LastAttemptSummary>,
}

/// Most recent journal entry in a status response.
#[derive(Debug, Serialize)]
pub struct LastAttemptSummary {
    /// 1-based ordinal.
    pub attempt_no: i32,
    /// Response code; 0 when no response arrived.
    pub http_status_code: i32,
    /// Symbolic failure tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Redacted failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall time of the call.
    pub latency_ms: i64,
    /// Journal timestamp.
    pub created_at: String,
}

/// Structured error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Numeric error code mirroring the HTTP status.
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { code: status.as_u16(), message: message.into() }))
        .into_response()
}

/// `POST /v1/notify` — validates and persists a submission.
#[instrument(name = "create_notification", skip(state, http_headers, request), fields(partner_id = %request.partner_id))]
pub async fn create_notification(
    State(state): State<AppState>,
    http_headers: HeaderMap,
    Json(request): Json<CreateNotificationRequest>,
) -> Response {
    if request.partner_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "partner_id is required");
    }
    if request.target_url.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "target_url is required");
    }

    if let Some(condition) = request.success_condition.as_deref() {
        if !condition.trim().is_empty() {
            return error_response(
                StatusCode::BAD_REQUEST,
                "success_condition is reserved and must be empty",
            );
        }
    }

    let method = match request.method.as_deref() {
        None | Some("") => HttpMethod::default(),
        Some(raw) => match raw.parse::<HttpMethod>() {
            Ok(method) => method,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
    };

    let max_attempts = request.max_attempts.unwrap_or(state.config.worker.max_attempts);
    if !(1..=10).contains(&max_attempts) {
        return error_response(StatusCode::BAD_REQUEST, "max_attempts must be within 1..=10");
    }

    if let Err(rejection) =
        policy::check_target_url(&request.target_url, &state.config.security.allowed_domains)
    {
        let status = match rejection {
            policy::PolicyRejection::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::FORBIDDEN,
        };
        warn!(target_url = %request.target_url, rejection = %rejection, "target URL refused");
        return error_response(status, rejection.to_string());
    }

    // Key from the body, with the Idempotency-Key header as fallback.
    let idempotency_key = request
        .idempotency_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| {
            http_headers
                .get("idempotency-key")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        });

    if let Some(key) = idempotency_key.as_deref() {
        match state.storage.tasks.find_by_idempotency_key(key, &request.partner_id).await {
            Ok(Some(existing)) => {
                info!(task_id = %existing.task_id, "idempotent submission, returning existing task");
                return (
                    StatusCode::OK,
                    Json(CreateNotificationResponse {
                        task_id: existing.task_id.to_string(),
                        status: existing.status.to_string(),
                    }),
                )
                    .into_response();
            },
            Ok(None) => {},
            Err(e) => {
                error!(error = %e, "idempotency lookup failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to create notification",
                );
            },
        }
    }

    let body = match &request.body {
        None | Some(serde_json::Value::Null) => Vec::new(),
        // A JSON string body is stored as its raw characters; any other
        // JSON value is stored as its serialization.
        Some(serde_json::Value::String(s)) => s.clone().into_bytes(),
        Some(other) => match serde_json::to_vec(other) {
            Ok(bytes) => bytes,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("unserializable body: {e}"));
            },
        },
    };

    let task = NewTask {
        task_id: TaskId::generate(),
        partner_id: request.partner_id.clone(),
        target_url: request.target_url.clone(),
        http_method: method,
        headers: rewrite_sensitive(&request.headers.clone().unwrap_or_default()),
        body,
        idempotency_key: idempotency_key.clone(),
        priority: request.priority.unwrap_or(0),
        max_attempts,
        success_condition: None,
    };

    match state.storage.tasks.create(&task, state.clock.now_utc()).await {
        Ok(_) => {
            info!(task_id = %task.task_id, "notification task created");
            (
                StatusCode::CREATED,
                Json(CreateNotificationResponse {
                    task_id: task.task_id.to_string(),
                    status: "pending".to_string(),
                }),
            )
                .into_response()
        },
        Err(e) if e.is_duplicate() => {
            // Lost the insert race on the idempotency key; the winner's row
            // is the canonical task.
            recover_duplicate(&state, idempotency_key.as_deref(), &request.partner_id).await
        },
        Err(e) => {
            error!(error = %e, "task insert failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create notification")
        },
    }
}

async fn recover_duplicate(
    state: &AppState,
    idempotency_key: Option<&str>,
    partner_id: &str,
) -> Response {
    let Some(key) = idempotency_key else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create notification");
    };

    match state.storage.tasks.find_by_idempotency_key(key, partner_id).await {
        Ok(Some(existing)) => (
            StatusCode::OK,
            Json(CreateNotificationResponse {
                task_id: existing.task_id.to_string(),
                status: existing.status.to_string(),
            }),
        )
            .into_response(),
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create notification"),
    }
}

/// `GET /v1/notify/{task_id}` — task snapshot plus last attempt summary.
#[instrument(name = "get_notification", skip(state))]
pub async fn get_notification(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    let task_id = TaskId::from(task_id);

    let task = match state.storage.tasks.find_by_task_id(&task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "notification not found"),
        Err(e) => {
            error!(error = %e, "task lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to get notification");
        },
    };

    let attempts = match state.storage.attempts.find_by_task_id(&task_id).await {
        Ok(attempts) => attempts,
        Err(e) => {
            error!(error = %e, "attempt lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to get notification");
        },
    };

    (StatusCode::OK, Json(snapshot(&task, &attempts))).into_response()
}

fn snapshot(task: &NotificationTask, attempts: &[NotificationAttempt]) -> GetNotificationResponse {
    let next_attempt_at =
        (!task.status.is_terminal()).then(|| task.next_attempt_at.to_rfc3339());

    let last_attempt = attempts.last().map(|attempt| LastAttemptSummary {
        attempt_no: attempt.attempt_no,
        http_status_code: attempt.http_status_code,
        error_code: attempt.error_code.clone(),
        error_message: attempt.error_message.clone(),
        latency_ms: attempt.latency_ms,
        created_at: attempt.created_at.to_rfc3339(),
    });

    GetNotificationResponse {
        task_id: task.task_id.to_string(),
        partner_id: task.partner_id.clone(),
        target_url: task.target_url.clone(),
        method: task.http_method.to_string(),
        status: task.status.to_string(),
        max_attempts: task.max_attempts,
        attempt_count: task.attempt_count,
        next_attempt_at,
        created_at: task.created_at.to_rfc3339(),
        updated_at: task.updated_at.to_rfc3339(),
        last_attempt,
    }
}

/// `POST /v1/notify/{task_id}/cancel` — terminal cancel for non-terminal
/// tasks.
#[instrument(name = "cancel_notification", skip(state))]
pub async fn cancel_notification(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    let task_id = TaskId::from(task_id);

    match state.storage.tasks.find_by_task_id(&task_id).await {
        Ok(Some(_)) => {},
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "notification not found"),
        Err(e) => {
            error!(error = %e, "task lookup failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to cancel notification",
            );
        },
    }

    match state.storage.tasks.mark_cancelled(&task_id, state.clock.now_utc()).await {
        Ok(true) => {
            info!(task_id = %task_id, "notification cancelled");
            (
                StatusCode::OK,
                Json(CreateNotificationResponse {
                    task_id: task_id.to_string(),
                    status: "cancelled".to_string(),
                }),
            )
                .into_response()
        },
        Ok(false) => {
            error_response(StatusCode::BAD_REQUEST, "cannot cancel a task in terminal state")
        },
        Err(e) => {
            error!(error = %e, "cancel failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to cancel notification")
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use notifyd_core::{AttemptStatus, TaskStatus};

    use super::*;

    fn sample_task(status: TaskStatus) -> NotificationTask {
        NotificationTask {
            id: 1,
            task_id: TaskId::from("task_abc".to_string()),
            partner_id: "p".to_string(),
            target_url: "https://hooks.example.com/x".to_string(),
            http_method: HttpMethod::Post,
            headers: sqlx::types::Json(HashMap::new()),
            body: Vec::new(),
            idempotency_key: None,
            priority: 0,
            status,
            next_attempt_at: Utc::now(),
            max_attempts: 3,
            attempt_count: 1,
            success_condition: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_attempt(attempt_no: i32) -> NotificationAttempt {
        NotificationAttempt {
            id: attempt_no.into(),
            task_id: TaskId::from("task_abc".to_string()),
            attempt_no,
            status: AttemptStatus::Sent,
            http_status_code: 503,
            error_code: Some("HTTP_STATUS_503".to_string()),
            error_message: None,
            latency_ms: 40,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_hides_next_attempt_for_terminal_tasks() {
        let response = snapshot(&sample_task(TaskStatus::Succeeded), &[]);
        assert!(response.next_attempt_at.is_none());

        let response = snapshot(&sample_task(TaskStatus::Failed), &[]);
        assert!(response.next_attempt_at.is_some());

        let response = snapshot(&sample_task(TaskStatus::Pending), &[]);
        assert!(response.next_attempt_at.is_some());
    }

    #[test]
    fn snapshot_surfaces_the_latest_attempt() {
        let attempts = vec![sample_attempt(1), sample_attempt(2)];
        let response = snapshot(&sample_task(TaskStatus::Failed), &attempts);

        let last = response.last_attempt.expect("latest attempt should be present");
        assert_eq!(last.attempt_no, 2);
        assert_eq!(last.error_code.as_deref(), Some("HTTP_STATUS_503"));

        let response = snapshot(&sample_task(TaskStatus::Pending), &[]);
        assert!(response.last_attempt.is_none());
    }
}
