//! Domain models for notification tasks and their attempt journal.
//!
//! Defines the task and attempt entities, the status enums backing the task
//! state machine, and newtype identifiers with PostgreSQL codecs. Status
//! values round-trip through their `Display` form so the database stores
//! plain lowercase strings.

use std::{collections::HashMap, fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// External handle of a notification task.
///
/// Opaque short string of the form `task_<uuid>`. The surrogate database key
/// never leaves the store; every API surface and log line uses this handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a fresh task ID from a random UUID.
    pub fn generate() -> Self {
        Self(format!("task_{}", Uuid::new_v4().simple()))
    }

    /// The handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl sqlx::Type<PgDb> for TaskId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TaskId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for TaskId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Task lifecycle status.
///
/// ```text
/// pending ──────> running ──> succeeded
///    ^               │
///    │ (reaper)      ├──────> failed ──(claim)──> running
///    └───────────────┤           │
///                    │           └──(cap hit)───> dead
///    pending|running|failed ────────────────────> cancelled
/// ```
///
/// `succeeded`, `cancelled`, and `dead` are terminal: no transition ever
/// leaves them. `failed` is re-claimable and distinguishes "attempted and
/// scheduled for retry" from a never-attempted `pending` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, never attempted.
    Pending,

    /// Claimed by exactly one worker across all replicas.
    Running,

    /// Attempted at least once; eligible for re-claim at `next_attempt_at`.
    Failed,

    /// Delivered. Terminal.
    Succeeded,

    /// Cancelled through the API. Terminal.
    Cancelled,

    /// Attempt cap exhausted. Terminal.
    Dead,
}

impl TaskStatus {
    /// Whether this status is write-once.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Cancelled | Self::Dead)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "succeeded" => Ok(Self::Succeeded),
            "cancelled" => Ok(Self::Cancelled),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for TaskStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TaskStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// Outcome label of a journaled attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The request reached the remote and a response came back (any code).
    Sent,

    /// Reserved for future classification refinements.
    Success,

    /// The transport produced no response (connect failure, timeout).
    Failed,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "sent" => Ok(Self::Sent),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid attempt status: {s}").into()),
        }
    }
}

/// HTTP methods accepted for outbound delivery.
///
/// Anything outside this whitelist is rejected at ingest, so the dispatcher
/// never sees an unvalidated method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST (default).
    #[default]
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    /// Parses a method name, normalizing case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported http method: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for HttpMethod {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for HttpMethod {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// A single delivery intent: one row in `notification_tasks`.
///
/// Frozen at insert except for the state-machine columns (`status`,
/// `next_attempt_at`, `attempt_count`, `updated_at`), which only the
/// dispatcher's claim/outcome transitions and the ingest cancel touch.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationTask {
    /// Surrogate key; assigned by the database.
    pub id: i64,

    /// External handle.
    pub task_id: TaskId,

    /// Tenancy and idempotency scope.
    pub partner_id: String,

    /// Absolute target URL, frozen at insert.
    pub target_url: String,

    /// Outbound method.
    pub http_method: HttpMethod,

    /// Request headers. Sensitive values are stored as `{{NAME}}`
    /// placeholders and resolved at dispatch time.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Request body, sent verbatim.
    pub body: Vec<u8>,

    /// Optional idempotency key, unique per partner when present.
    pub idempotency_key: Option<String>,

    /// Higher priority wins ties at claim time.
    pub priority: i32,

    /// Current state-machine label.
    pub status: TaskStatus,

    /// When the task becomes due for a claim.
    pub next_attempt_at: DateTime<Utc>,

    /// Attempt cap, 1..=10.
    pub max_attempts: i32,

    /// Attempts already journaled. Maintained by the journal append
    /// transaction, never by callers.
    pub attempt_count: i32,

    /// Reserved; non-empty values are rejected at ingest.
    pub success_condition: Option<String>,

    /// Insert timestamp.
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp. The claim refreshes it, which is what the
    /// reaper ages against.
    pub updated_at: DateTime<Utc>,
}

impl NotificationTask {
    /// Headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Body as `Bytes` for the outbound client.
    pub fn body_bytes(&self) -> Bytes {
        Bytes::from(self.body.clone())
    }
}

/// Insertable task fields, before the database assigns the surrogate key.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// External handle to assign.
    pub task_id: TaskId,
    /// Tenancy scope.
    pub partner_id: String,
    /// Absolute target URL.
    pub target_url: String,
    /// Outbound method.
    pub http_method: HttpMethod,
    /// Headers with sensitive values already rewritten to placeholders.
    pub headers: HashMap<String, String>,
    /// Verbatim request body.
    pub body: Vec<u8>,
    /// Optional idempotency key.
    pub idempotency_key: Option<String>,
    /// Claim-ordering priority.
    pub priority: i32,
    /// Attempt cap.
    pub max_attempts: i32,
    /// Reserved.
    pub success_condition: Option<String>,
}

/// One journaled HTTP call against a task's target: a row in
/// `notification_attempts`. Append-only; rows are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationAttempt {
    /// Surrogate key.
    pub id: i64,

    /// External handle of the owning task.
    pub task_id: TaskId,

    /// 1-based ordinal, gap-free and strictly increasing per task.
    pub attempt_no: i32,

    /// Outcome label.
    pub status: AttemptStatus,

    /// Response code; 0 when no response arrived.
    pub http_status_code: i32,

    /// Symbolic failure tag, e.g. `HTTP_REQUEST_TIMEOUT`.
    pub error_code: Option<String>,

    /// Redacted, truncated failure description.
    pub error_message: Option<String>,

    /// Wall time of the HTTP call.
    pub latency_ms: i64,

    /// Journal timestamp.
    pub created_at: DateTime<Utc>,
}

/// Result of one HTTP call, ready to journal.
///
/// The attempt ordinal is deliberately absent: the store derives it from the
/// task row inside the recording transaction.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Outcome label.
    pub status: AttemptStatus,
    /// Response code; 0 when no response arrived.
    pub http_status_code: i32,
    /// Symbolic failure tag.
    pub error_code: Option<String>,
    /// Redacted, truncated failure description.
    pub error_message: Option<String>,
    /// Wall time of the HTTP call.
    pub latency_ms: i64,
}
