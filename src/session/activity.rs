//! Activity tracker: heartbeat ticker, idle timer, MCP health probe, and
//! the delta coalescer window.
//!
//! All timers reset on [`ActivityTracker::record_activity`]. Owned
//! exclusively by the supervisor for the session's lifetime.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const SIGKILL_GRACE: Duration = Duration::from_secs(5);
pub const DELTA_COALESCE_WINDOW: Duration = Duration::from_millis(75);

/// Liveness probe: `kill(pid, 0)`. Returns `true` if the process (or
/// process group) still exists.
#[cfg(unix)]
pub fn is_pid_alive(pid: i32) -> bool {
    // signal 0 performs no action but still validates the pid exists and is
    // visible to us.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: i32) -> bool {
    true
}

/// Tracks last-activity time and exposes a `Notify` other tasks can wait
/// on to detect activity resets (used by the idle timer).
pub struct ActivityTracker {
    last_active_ms: AtomicI64,
    reset: Notify,
    idle_timeout: Duration,
    terminating: AtomicBool,
}

impl ActivityTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            last_active_ms: AtomicI64::new(now_ms()),
            reset: Notify::new(),
            idle_timeout,
            terminating: AtomicBool::new(false),
        }
    }

    pub fn record_activity(&self) {
        self.last_active_ms.store(now_ms(), Ordering::SeqCst);
        self.reset.notify_waiters();
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn mark_terminating(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Wait until `idle_timeout` has elapsed with no intervening
    /// `record_activity` call. Returns when the timer actually expires;
    /// callers loop this inside a `tokio::select!` against other signals.
    pub async fn wait_for_idle(self: &Arc<Self>) {
        loop {
            let deadline = Instant::now() + self.idle_timeout;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = self.reset.notified() => continue,
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_activity_resets_the_idle_timer() {
        let tracker = Arc::new(ActivityTracker::new(Duration::from_millis(40)));
        let t = tracker.clone();
        let handle = tokio::spawn(async move {
            t.wait_for_idle().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.record_activity();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.await.unwrap();
    }

    #[test]
    fn terminating_flag_round_trips() {
        let tracker = ActivityTracker::new(Duration::from_secs(1));
        assert!(!tracker.is_terminating());
        tracker.mark_terminating();
        assert!(tracker.is_terminating());
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_alive() {
        let pid = std::process::id() as i32;
        assert!(is_pid_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn very_unlikely_pid_is_dead() {
        assert!(!is_pid_alive(i32::MAX - 1));
    }
}
