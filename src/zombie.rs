//! Boot-time zombie reconciler (§4.7).
//!
//! A worker crash mid-session leaves `active`/`awaiting_input` rows behind
//! with no live supervisor. On every boot, before accepting new work, this
//! walks this worker's own live-looking sessions and resolves each one: if
//! the recorded pid is still alive, it's re-adoptable by re-running the
//! session through the normal claim path; if not, it's released back to
//! `idle` (bounded by `max_reenqueue_attempts`) or marked `ended` once that
//! bound is exhausted. One-shot executions have no pid to probe — any
//! `running`/`cancelling` row left over is unconditionally orphaned.

use crate::config::WorkerConfig;
use crate::session::activity::is_pid_alive;
use crate::storage::Storage;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReconcileReport {
    pub sessions_released: u64,
    pub sessions_ended: u64,
    pub executions_orphaned: u64,
}

/// Runs once at startup, before the IPC server accepts connections and
/// before the scheduler admits new sessions.
pub async fn reconcile(storage: &Arc<Storage>, config: &WorkerConfig) -> anyhow::Result<ReconcileReport> {
    let owned = storage.list_owned_live_sessions(&config.worker_id).await?;
    let mut released = 0u64;
    let mut ended = 0u64;

    for row in owned {
        let pid_alive = row.pid.map(|p| is_pid_alive(p as i32)).unwrap_or(false);

        if pid_alive {
            // The OS process somehow survived our crash (e.g. we were killed
            // but the child wasn't, since it runs in its own process group).
            // There is no supervisor to hand it back to: kill it and treat
            // this as a normal unexpected-exit release, same as if the
            // heartbeat loop had observed the death itself.
            if let Some(pid) = row.pid {
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }

        if row.reenqueue_count >= config.max_reenqueue_attempts as i64 {
            warn!(
                session_id = %row.id,
                reenqueue_count = row.reenqueue_count,
                "zombie session exceeded max reenqueue attempts — marking ended"
            );
            storage.release_claim(&row.id, "ended").await?;
            ended += 1;
        } else {
            storage.increment_reenqueue_count(&row.id).await?;
            storage.release_claim(&row.id, "idle").await?;
            info!(session_id = %row.id, "zombie session released back to idle");
            released += 1;
        }
    }

    let executions_orphaned = storage.reconcile_orphaned_executions().await?;
    if executions_orphaned > 0 {
        info!(count = executions_orphaned, "orphaned one-shot executions marked failed");
    }

    Ok(ReconcileReport {
        sessions_released: released,
        sessions_ended: ended,
        executions_orphaned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_fields_are_additive_counters() {
        let r = ReconcileReport { sessions_released: 1, sessions_ended: 2, executions_orphaned: 3 };
        assert_eq!(r.sessions_released + r.sessions_ended, 3);
    }
}
