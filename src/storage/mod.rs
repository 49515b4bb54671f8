//! SQLite-backed persistence: sessions, one-shot executions, and settings.
//!
//! The session row is the source of truth for lifecycle state; holders of
//! the claim (see [`Storage::claim_session`]) have exclusive write rights
//! to its lifecycle columns. All timestamp columns are RFC3339 strings.

use anyhow::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: String,
    pub agent_id: String,
    pub capability_id: String,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub session_ref: Option<String>,
    pub status: String,
    pub permission_mode: String,
    pub model: Option<String>,
    /// JSON array of tool names.
    pub allowed_tools: String,
    pub initial_prompt: String,
    pub worker_id: Option<String>,
    pub pid: Option<i64>,
    pub started_at: Option<String>,
    pub heartbeat_at: Option<String>,
    pub last_active_at: Option<String>,
    pub ended_at: Option<String>,
    pub log_file_path: Option<String>,
    pub event_seq: i64,
    pub idle_timeout_sec: i64,
    pub plan_file_path: Option<String>,
    pub title: Option<String>,
    pub reenqueue_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRow {
    pub fn allowed_tools_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.allowed_tools).unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRow {
    pub id: String,
    pub session_id: Option<String>,
    pub agent_id: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("agendo-host.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_session(
        &self,
        id: &str,
        agent_id: &str,
        capability_id: &str,
        project_id: Option<&str>,
        task_id: Option<&str>,
        permission_mode: &str,
        initial_prompt: &str,
        idle_timeout_sec: i64,
        title: Option<&str>,
    ) -> Result<SessionRow> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions
               (id, agent_id, capability_id, project_id, task_id, status,
                permission_mode, allowed_tools, initial_prompt, event_seq,
                idle_timeout_sec, title, reenqueue_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'idle', ?, '[]', ?, 0, ?, ?, 0, ?, ?)",
        )
        .bind(id)
        .bind(agent_id)
        .bind(capability_id)
        .bind(project_id)
        .bind(task_id)
        .bind(permission_mode)
        .bind(initial_prompt)
        .bind(idle_timeout_sec)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn count_sessions(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Atomic claim: set `status='active', workerId=self, startedAt=now,
    /// heartbeatAt=now` IFF previous status is `idle` or `ended`. Returns
    /// `true` on success. A zero-row CAS is the `ClaimRace` case — callers
    /// treat it as "already claimed" and resolve their futures without
    /// erroring.
    pub async fn claim_session(&self, id: &str, worker_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        // Claiming from `active` is forbidden — the zombie reconciler
        // guarantees a crashed run is first reset to `idle` before
        // anything may claim it again.
        let result = sqlx::query(
            "UPDATE sessions SET status = 'active', worker_id = ?, started_at = ?, \
             heartbeat_at = ?, updated_at = ? \
             WHERE id = ? AND status IN ('idle', 'ended')",
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_status(&self, id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release the claim: set `status`, null `worker_id`/`pid`, stamp
    /// `last_active_at`/`ended_at` as appropriate for the target status.
    pub async fn release_claim(&self, id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let ended_at: Option<&str> = if status == "ended" { Some(&now) } else { None };
        sqlx::query(
            "UPDATE sessions SET status = ?, worker_id = NULL, pid = NULL, \
             last_active_at = ?, ended_at = COALESCE(?, ended_at), updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(&now)
        .bind(ended_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_pid(&self, id: &str, pid: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET pid = ? WHERE id = ?")
            .bind(pid)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_heartbeat(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET heartbeat_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_active(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_ref(&self, id: &str, session_ref: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET session_ref = ? WHERE id = ?")
            .bind(session_ref)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_session_ref(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET session_ref = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_log_file_path(&self, id: &str, path: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET log_file_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, id: &str, mode: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET permission_mode = ? WHERE id = ?")
            .bind(mode)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_model(&self, id: &str, model: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET model = ? WHERE id = ?")
            .bind(model)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_initial_prompt(&self, id: &str, prompt: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET initial_prompt = ? WHERE id = ?")
            .bind(prompt)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_plan_file_path(&self, id: &str, path: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET plan_file_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent append to `allowedTools` — persists across "clear context
    /// + restart" since it lives on the session row, not adapter state.
    pub async fn allow_tool(&self, id: &str, tool_name: &str) -> Result<()> {
        let row = self
            .get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found"))?;
        let mut tools = row.allowed_tools_vec();
        if !tools.iter().any(|t| t == tool_name) {
            tools.push(tool_name.to_string());
            let json = serde_json::to_string(&tools)?;
            sqlx::query("UPDATE sessions SET allowed_tools = ? WHERE id = ?")
                .bind(&json)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Allocate the next `eventSeq` and persist it atomically. The caller
    /// must hold the session's claim; no other writer advances this column.
    pub async fn next_event_seq(&self, id: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT event_seq FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let next = row.0 + 1;
        sqlx::query("UPDATE sessions SET event_seq = ? WHERE id = ?")
            .bind(next)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next)
    }

    pub async fn increment_reenqueue_count(&self, id: &str) -> Result<i64> {
        sqlx::query("UPDATE sessions SET reenqueue_count = reenqueue_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let row: (i64,) = sqlx::query_as("SELECT reenqueue_count FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn reset_reenqueue_count(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET reenqueue_count = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sessions this worker owns that are still marked `active` or
    /// `awaiting_input` — the zombie reconciler's boot-time candidate set.
    pub async fn list_owned_live_sessions(&self, worker_id: &str) -> Result<Vec<SessionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM sessions WHERE worker_id = ? AND status IN ('active', 'awaiting_input')",
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ─── Executions (one-shot runs) ─────────────────────────────────────────

    pub async fn create_execution(&self, id: &str, agent_id: &str, session_id: Option<&str>) -> Result<ExecutionRow> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO executions (id, session_id, agent_id, status, created_at, updated_at)
             VALUES (?, ?, ?, 'queued', ?, ?)",
        )
        .bind(id)
        .bind(session_id)
        .bind(agent_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_execution(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("execution not found after insert"))
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRow>> {
        Ok(sqlx::query_as("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn update_execution_status(&self, id: &str, status: &str, error: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE executions SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Boot-time reconciliation analog for one-shot runs: any execution
    /// still `running`/`cancelling` when the worker restarted was orphaned.
    pub async fn reconcile_orphaned_executions(&self) -> Result<u64> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let n = sqlx::query(
                "UPDATE executions SET status = 'failed', error = 'orphaned', updated_at = ? \
                 WHERE status IN ('running', 'cancelling')",
            )
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n)
        })
        .await
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn make_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn create_and_get_session_round_trips() {
        let (storage, _dir) = make_storage().await;
        let row = storage
            .create_session("s1", "claude", "cap1", None, None, "default", "hello", 3600, None)
            .await
            .unwrap();
        assert_eq!(row.status, "idle");
        assert_eq!(row.event_seq, 0);
        let fetched = storage.get_session("s1").await.unwrap().unwrap();
        assert_eq!(fetched.initial_prompt, "hello");
    }

    #[tokio::test]
    async fn claim_is_atomic_across_concurrent_callers() {
        let (storage, _dir) = make_storage().await;
        storage
            .create_session("s1", "claude", "cap1", None, None, "default", "hi", 3600, None)
            .await
            .unwrap();
        let storage = Arc::new(storage);
        let mut handles = Vec::new();
        for i in 0..8 {
            let s = storage.clone();
            handles.push(tokio::spawn(async move {
                s.claim_session("s1", &format!("worker-{i}")).await.unwrap()
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn claim_from_active_is_rejected() {
        let (storage, _dir) = make_storage().await;
        storage
            .create_session("s1", "claude", "cap1", None, None, "default", "hi", 3600, None)
            .await
            .unwrap();
        assert!(storage.claim_session("s1", "w1").await.unwrap());
        assert!(!storage.claim_session("s1", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn event_seq_is_monotonic_and_continues_across_runs() {
        let (storage, _dir) = make_storage().await;
        storage
            .create_session("s1", "claude", "cap1", None, None, "default", "hi", 3600, None)
            .await
            .unwrap();
        let a = storage.next_event_seq("s1").await.unwrap();
        let b = storage.next_event_seq("s1").await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        storage.release_claim("s1", "idle").await.unwrap();
        let c = storage.next_event_seq("s1").await.unwrap();
        assert_eq!(c, 3);
    }

    #[tokio::test]
    async fn allow_tool_is_idempotent() {
        let (storage, _dir) = make_storage().await;
        storage
            .create_session("s1", "claude", "cap1", None, None, "default", "hi", 3600, None)
            .await
            .unwrap();
        storage.allow_tool("s1", "Bash").await.unwrap();
        storage.allow_tool("s1", "Bash").await.unwrap();
        let row = storage.get_session("s1").await.unwrap().unwrap();
        assert_eq!(row.allowed_tools_vec(), vec!["Bash".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_orphaned_executions_marks_failed() {
        let (storage, _dir) = make_storage().await;
        storage.create_execution("e1", "claude", None).await.unwrap();
        storage.update_execution_status("e1", "running", None).await.unwrap();
        let n = storage.reconcile_orphaned_executions().await.unwrap();
        assert_eq!(n, 1);
        let row = storage.get_execution("e1").await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error.as_deref(), Some("orphaned"));
    }
}
