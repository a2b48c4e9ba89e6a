//! Worker pipeline tests against a real PostgreSQL instance and a mock
//! remote.
//!
//! Ignored by default. Claims are global per database, so run these
//! serially:
//!
//! ```text
//! TEST_DATABASE_URL=postgres://localhost/notifyd_test \
//!     cargo test -- --ignored --test-threads=1
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use notifyd_core::{
    storage::Storage, HttpMethod, NewTask, RealClock, TaskId, TaskStatus,
};
use notifyd_dispatch::{
    ClientConfig, DispatchConfig, DispatchStats, DispatchWorker, OutboundClient, RetryPolicy,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

async fn test_storage() -> Storage {
    let dsn = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must point at a PostgreSQL instance");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&dsn)
        .await
        .expect("failed to connect to test database");

    create_schema(&pool).await;
    Storage::new(pool)
}

async fn create_schema(pool: &sqlx::PgPool) {
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
            max_attempts INTEGER NOT NULL DEFAULT 3,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            success_condition TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .expect("create notification_tasks");

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
    .expect("create notification_attempts");
}

fn new_task(target_url: &str, max_attempts: i32) -> NewTask {
    NewTask {
        task_id: TaskId::generate(),
        partner_id: "partner-tests".to_string(),
        target_url: target_url.to_string(),
        http_method: HttpMethod::Post,
        headers: HashMap::new(),
        body: b"ping".to_vec(),
        idempotency_key: None,
        priority: 0,
        max_attempts,
        success_condition: None,
    }
}

fn test_worker(storage: Storage, retry_base: Duration) -> DispatchWorker {
    let config = DispatchConfig {
        retry_policy: RetryPolicy {
            base_backoff: retry_base,
            jitter_factor: 0.1,
            ..Default::default()
        },
        client_config: ClientConfig {
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = Arc::new(OutboundClient::new(config.client_config.clone()).unwrap());

    DispatchWorker::new(
        0,
        storage,
        config,
        client,
        Arc::new(RwLock::new(DispatchStats::default())),
        CancellationToken::new(),
        Arc::new(RealClock),
    )
}

async fn claim_one(storage: &Storage, task_id: &TaskId) -> notifyd_core::NotificationTask {
    let claimed = storage
        .tasks
        .claim_due(100, chrono::Utc::now())
        .await
        .expect("claim should succeed");

    claimed
        .into_iter()
        .find(|t| &t.task_id == task_id)
        .expect("the inserted task should be claimable")
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn successful_delivery_journals_and_succeeds() {
    let storage = test_storage().await;
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let task = new_task(&format!("{}/hook", mock_server.uri()), 3);
    let task_id = task.task_id.clone();
    storage.tasks.create(&task, chrono::Utc::now()).await.unwrap();

    let worker = test_worker(storage.clone(), Duration::from_secs(1));
    let claimed = claim_one(&storage, &task_id).await;
    worker.process_task(&claimed).await;

    let updated = storage.tasks.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Succeeded);
    assert_eq!(updated.attempt_count, 1);

    let attempts = storage.attempts.find_by_task_id(&task_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_no, 1);
    assert_eq!(attempts[0].http_status_code, 200);
    assert_eq!(attempts[0].status.to_string(), "sent");
    assert!(attempts[0].error_code.is_none());

    mock_server.verify().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn server_error_schedules_retry_with_backoff() {
    let storage = test_storage().await;
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let task = new_task(&mock_server.uri(), 3);
    let task_id = task.task_id.clone();
    storage.tasks.create(&task, chrono::Utc::now()).await.unwrap();

    let worker = test_worker(storage.clone(), Duration::from_secs(30));
    let claimed = claim_one(&storage, &task_id).await;
    let before = chrono::Utc::now();
    worker.process_task(&claimed).await;

    let updated = storage.tasks.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Failed);
    assert_eq!(updated.attempt_count, 1);
    // First retry waits the base backoff, within the +-10% jitter band.
    let delay = (updated.next_attempt_at - before).num_milliseconds();
    assert!((26_000..=34_000).contains(&delay), "unexpected retry delay: {delay}ms");

    let attempts = storage.attempts.find_by_task_id(&task_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error_code.as_deref(), Some("HTTP_STATUS_503"));
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn retry_then_success_ends_succeeded_with_two_attempts() {
    let storage = test_storage().await;
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let task = new_task(&mock_server.uri(), 3);
    let task_id = task.task_id.clone();
    storage.tasks.create(&task, chrono::Utc::now()).await.unwrap();

    let worker = test_worker(storage.clone(), Duration::from_secs(1));

    let claimed = claim_one(&storage, &task_id).await;
    worker.process_task(&claimed).await;

    // Wait out the 1s base backoff (plus jitter) so the task is due again.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let reclaimed = claim_one(&storage, &task_id).await;
    worker.process_task(&reclaimed).await;

    let updated = storage.tasks.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Succeeded);
    assert_eq!(updated.attempt_count, 2);

    let attempts = storage.attempts.find_by_task_id(&task_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_no, 1);
    assert_eq!(attempts[1].attempt_no, 2);
    assert_eq!(attempts[1].http_status_code, 200);
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn attempt_cap_exhaustion_marks_task_dead() {
    let storage = test_storage().await;
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let task = new_task(&mock_server.uri(), 1);
    let task_id = task.task_id.clone();
    storage.tasks.create(&task, chrono::Utc::now()).await.unwrap();

    let worker = test_worker(storage.clone(), Duration::from_secs(1));
    let claimed = claim_one(&storage, &task_id).await;
    worker.process_task(&claimed).await;

    let updated = storage.tasks.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Dead);
    assert_eq!(updated.attempt_count, 1);

    // A dead task is invisible to further claims.
    let reclaimed = storage.tasks.claim_due(100, chrono::Utc::now()).await.unwrap();
    assert!(reclaimed.iter().all(|t| t.task_id != task_id));
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn transport_failure_journals_zero_status_code() {
    let storage = test_storage().await;

    // Nothing listens on the discard port.
    let task = new_task("http://127.0.0.1:9/hook", 2);
    let task_id = task.task_id.clone();
    storage.tasks.create(&task, chrono::Utc::now()).await.unwrap();

    let worker = test_worker(storage.clone(), Duration::from_secs(60));
    let claimed = claim_one(&storage, &task_id).await;
    worker.process_task(&claimed).await;

    let attempts = storage.attempts.find_by_task_id(&task_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].http_status_code, 0);
    assert_eq!(attempts[0].status.to_string(), "failed");
    assert_eq!(attempts[0].error_code.as_deref(), Some("HTTP_REQUEST_FAILED"));

    let updated = storage.tasks.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Failed);
}

#[tokio::test]
#[ignore = "requires PostgreSQL via TEST_DATABASE_URL"]
async fn cancel_mid_flight_is_not_reopened_by_the_attempt() {
    let storage = test_storage().await;
    let mock_server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let task = new_task(&mock_server.uri(), 3);
    let task_id = task.task_id.clone();
    storage.tasks.create(&task, chrono::Utc::now()).await.unwrap();

    let worker = test_worker(storage.clone(), Duration::from_secs(1));
    let claimed = claim_one(&storage, &task_id).await;

    // Cancel lands while the HTTP call is in flight.
    let cancel_storage = storage.clone();
    let cancel_id = task_id.clone();
    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_storage.tasks.mark_cancelled(&cancel_id, chrono::Utc::now()).await.unwrap()
    });

    worker.process_task(&claimed).await;
    assert!(cancel.await.unwrap(), "cancel should have transitioned the running task");

    let updated = storage.tasks.find_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Cancelled);

    // The completed in-flight attempt neither reopened the task nor
    // journaled against a terminal state.
    let attempts = storage.attempts.find_by_task_id(&task_id).await.unwrap();
    assert!(attempts.is_empty());
}
