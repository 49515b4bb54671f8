//! Per-tool-call approval gates.
//!
//! Holds single-shot deciders keyed by `approvalId`. The gate map lives
//! entirely in process memory — on resume, any pending approval from the
//! prior run is lost (accepted data loss, see DESIGN.md). Session-scoped
//! allowlisting is persisted to the session row's `allowedTools` column by
//! the caller, not by this module.

use crate::policy::risk::{RiskDatabase, RiskLevel};
use crate::session::types::ApprovalDecision;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: ApprovalDecision,
    pub updated_input: Option<serde_json::Value>,
}

impl Resolution {
    pub fn deny() -> Self {
        Self {
            decision: ApprovalDecision::Deny,
            updated_input: None,
        }
    }

    pub fn allow() -> Self {
        Self {
            decision: ApprovalDecision::Allow,
            updated_input: None,
        }
    }
}

/// Owns the in-flight approval gates for one session. Exclusive to the
/// supervisor holding the session's claim; no cross-task access.
pub struct ApprovalGateMap {
    risk_db: Arc<RiskDatabase>,
    gates: Mutex<HashMap<String, oneshot::Sender<Resolution>>>,
    /// Tool names granted `allow-session` (this run, or carried over from
    /// `allowedTools` on the session row). Consulted by `open` so a
    /// previously-allowed tool never re-prompts for the rest of the run.
    session_allowed: Mutex<HashSet<String>>,
}

impl ApprovalGateMap {
    pub fn new(risk_db: Arc<RiskDatabase>) -> Self {
        Self {
            risk_db,
            gates: Mutex::new(HashMap::new()),
            session_allowed: Mutex::new(HashSet::new()),
        }
    }

    pub fn risk_of(&self, tool_name: &str) -> RiskLevel {
        self.risk_db.get_risk(tool_name)
    }

    /// Seed the session-allow set from the session row's persisted
    /// `allowedTools`, so an `allow-session` grant from a prior run still
    /// auto-allows on resume.
    pub async fn seed_allowed_tools(&self, tools: impl IntoIterator<Item = String>) {
        self.session_allowed.lock().await.extend(tools);
    }

    /// Grant `tool_name` blanket approval for the rest of this session.
    pub async fn mark_allowed(&self, tool_name: &str) {
        self.session_allowed.lock().await.insert(tool_name.to_string());
    }

    /// Register a new gate and return the receiving half the caller awaits.
    ///
    /// If `tool_name` already carries a session-wide `allow-session` grant,
    /// the gate resolves immediately with `allow` instead of waiting on a
    /// round-trip to the client — the tool-use still goes through this same
    /// path, it just never blocks.
    pub async fn open(&self, approval_id: &str, tool_name: &str) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        if self.session_allowed.lock().await.contains(tool_name) {
            let _ = tx.send(Resolution::allow());
        } else {
            self.gates.lock().await.insert(approval_id.to_string(), tx);
        }
        rx
    }

    /// Resolve a pending gate once. A missing or already-resolved id is
    /// logged and dropped — never an error, since a re-delivered decision
    /// (e.g. from a flaky client) must not crash the control loop.
    pub async fn resolve(&self, approval_id: &str, resolution: Resolution) {
        let sender = self.gates.lock().await.remove(approval_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(resolution);
            }
            None => warn!(approval_id, "approval resolved with no matching gate — dropped"),
        }
    }

    /// Drain all pending gates with `deny`. Called on interrupt/cancel and
    /// on ExitPlanMode option 1. Leaves the map empty.
    pub async fn drain_deny(&self) -> usize {
        let mut gates = self.gates.lock().await;
        let n = gates.len();
        for (_, tx) in gates.drain() {
            let _ = tx.send(Resolution::deny());
        }
        n
    }

    pub async fn pending_count(&self) -> usize {
        self.gates.lock().await.len()
    }
}

/// What the supervisor should do after an ExitPlanMode decision resolves.
#[derive(Debug, Clone)]
pub enum PlanModeOutcome {
    /// Option 1: deny the tool, tear down for a clean restart with a new
    /// initial prompt built from the plan file.
    ClearContextRestart { plan_file_path: String },
    /// Option 2: allow, then push a permission-mode change (and optionally
    /// a `/compact`) once the response reaches the agent.
    ContinueWithModeChange {
        new_permission_mode: String,
        post_approval_compact: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::risk::RiskDatabase;

    #[tokio::test]
    async fn resolve_unblocks_the_open_receiver() {
        let map = ApprovalGateMap::new(Arc::new(RiskDatabase::default_rules()));
        let rx = map.open("a1", "Bash").await;
        map.resolve(
            "a1",
            Resolution {
                decision: ApprovalDecision::Allow,
                updated_input: None,
            },
        )
        .await;
        let resolution = rx.await.unwrap();
        assert_eq!(resolution.decision, ApprovalDecision::Allow);
    }

    #[tokio::test]
    async fn resolve_on_unknown_id_is_a_noop() {
        let map = ApprovalGateMap::new(Arc::new(RiskDatabase::default_rules()));
        map.resolve("missing", Resolution::deny()).await;
    }

    #[tokio::test]
    async fn drain_deny_resolves_all_pending_gates() {
        let map = ApprovalGateMap::new(Arc::new(RiskDatabase::default_rules()));
        let rx1 = map.open("a1", "Bash").await;
        let rx2 = map.open("a2", "Write").await;
        let drained = map.drain_deny().await;
        assert_eq!(drained, 2);
        assert_eq!(rx1.await.unwrap().decision, ApprovalDecision::Deny);
        assert_eq!(rx2.await.unwrap().decision, ApprovalDecision::Deny);
        assert_eq!(map.pending_count().await, 0);
    }

    #[tokio::test]
    async fn open_auto_allows_a_tool_with_a_session_grant() {
        let map = ApprovalGateMap::new(Arc::new(RiskDatabase::default_rules()));
        map.mark_allowed("Bash").await;
        let rx = map.open("a1", "Bash").await;
        let resolution = rx.await.unwrap();
        assert_eq!(resolution.decision, ApprovalDecision::Allow);
        assert_eq!(map.pending_count().await, 0, "auto-allowed tool never registers a pending gate");
    }

    #[tokio::test]
    async fn seed_allowed_tools_carries_over_persisted_grants() {
        let map = ApprovalGateMap::new(Arc::new(RiskDatabase::default_rules()));
        map.seed_allowed_tools(vec!["Write".to_string()]).await;
        let rx = map.open("a1", "Write").await;
        assert_eq!(rx.await.unwrap().decision, ApprovalDecision::Allow);
    }
}
