//! Integration tests for boot-time zombie reconciliation (§4.7).
//!
//! These use `Storage` and `zombie::reconcile` directly — no real agent
//! CLI, no live worker process; a crash is simulated by writing `active`
//! rows straight into the database, the way a real crash would leave them.

use agendo_host::config::WorkerConfig;
use agendo_host::storage::Storage;
use agendo_host::zombie;
use tempfile::TempDir;

const WORKER_ID: &str = "worker-1";

async fn make_storage(dir: &TempDir) -> Storage {
    Storage::new(dir.path()).await.expect("storage init failed")
}

fn config_for(dir: &TempDir) -> WorkerConfig {
    WorkerConfig::new(
        Some(0),
        Some(dir.path().to_path_buf()),
        Some(dir.path().join("nonexistent-config.toml")),
        Some(WORKER_ID.to_string()),
        None,
        None,
        Some(4),
    )
}

/// A pid that is, with overwhelming likelihood, not a live process on the
/// test host — simulates a worker that crashed along with its child.
const DEAD_PID: i64 = i32::MAX as i64 - 1;

#[tokio::test]
async fn crashed_session_without_a_live_pid_is_released_to_idle() {
    let dir = TempDir::new().unwrap();
    let storage = std::sync::Arc::new(make_storage(&dir).await);
    let config = config_for(&dir);

    let session = storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();
    assert!(storage.claim_session(&session.id, WORKER_ID).await.unwrap());
    storage.set_pid(&session.id, DEAD_PID).await.unwrap();

    let report = zombie::reconcile(&storage, &config).await.unwrap();
    assert_eq!(report.sessions_released, 1);
    assert_eq!(report.sessions_ended, 0);
}

#[tokio::test]
async fn released_session_is_idle_with_no_owner_and_incremented_reenqueue_count() {
    let dir = TempDir::new().unwrap();
    let storage = std::sync::Arc::new(make_storage(&dir).await);
    let config = config_for(&dir);

    let session = storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();
    storage.claim_session(&session.id, WORKER_ID).await.unwrap();
    storage.set_pid(&session.id, DEAD_PID).await.unwrap();

    zombie::reconcile(&storage, &config).await.unwrap();

    let row = storage.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(row.status, "idle");
    assert!(row.worker_id.is_none());
    assert!(row.pid.is_none());
    assert_eq!(row.reenqueue_count, 1);
}

#[tokio::test]
async fn session_past_max_reenqueue_attempts_is_marked_ended_instead_of_released() {
    let dir = TempDir::new().unwrap();
    let storage = std::sync::Arc::new(make_storage(&dir).await);
    let config = config_for(&dir); // max_reenqueue_attempts defaults to 3

    let session = storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();

    for _ in 0..3 {
        storage.increment_reenqueue_count(&session.id).await.unwrap();
    }
    storage.claim_session(&session.id, WORKER_ID).await.unwrap();
    storage.set_pid(&session.id, DEAD_PID).await.unwrap();

    let report = zombie::reconcile(&storage, &config).await.unwrap();
    assert_eq!(report.sessions_ended, 1);
    assert_eq!(report.sessions_released, 0);

    let row = storage.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(row.status, "ended");
    assert!(row.ended_at.is_some());
}

#[tokio::test]
async fn awaiting_input_session_is_also_reconciled() {
    let dir = TempDir::new().unwrap();
    let storage = std::sync::Arc::new(make_storage(&dir).await);
    let config = config_for(&dir);

    let session = storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();
    storage.claim_session(&session.id, WORKER_ID).await.unwrap();
    storage.update_status(&session.id, "awaiting_input").await.unwrap();

    let report = zombie::reconcile(&storage, &config).await.unwrap();
    assert_eq!(report.sessions_released, 1);
}

#[tokio::test]
async fn idle_session_is_left_untouched() {
    let dir = TempDir::new().unwrap();
    let storage = std::sync::Arc::new(make_storage(&dir).await);
    let config = config_for(&dir);

    storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();

    let report = zombie::reconcile(&storage, &config).await.unwrap();
    assert_eq!(report.sessions_released, 0);
    assert_eq!(report.sessions_ended, 0);

    let row = storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(row.status, "idle");
}

#[tokio::test]
async fn orphaned_one_shot_executions_are_marked_failed() {
    let dir = TempDir::new().unwrap();
    let storage = std::sync::Arc::new(make_storage(&dir).await);
    let config = config_for(&dir);

    let exec = storage.create_execution("e1", "gemini", None).await.unwrap();
    storage.update_execution_status(&exec.id, "running", None).await.unwrap();
    let exec2 = storage.create_execution("e2", "gemini", None).await.unwrap();
    storage.update_execution_status(&exec2.id, "cancelling", None).await.unwrap();
    // A queued execution should not be touched.
    storage.create_execution("e3", "gemini", None).await.unwrap();

    let report = zombie::reconcile(&storage, &config).await.unwrap();
    assert_eq!(report.executions_orphaned, 2);

    let e1 = storage.get_execution("e1").await.unwrap().unwrap();
    assert_eq!(e1.status, "failed");
    assert_eq!(e1.error.as_deref(), Some("orphaned"));
    let e3 = storage.get_execution("e3").await.unwrap().unwrap();
    assert_eq!(e3.status, "queued");
}
