//! The orchestrating entity: atomic claim, spawn/resume, control serving,
//! state transitions, slot release, and exit reconciliation.
//!
//! One supervisor instance is created per `Start` call; it owns its
//! adapter, its slot, and its in-memory state exclusively for the
//! session's run. Crash recovery across restarts is the zombie
//! reconciler's job, not this module's.

use super::activity::{is_pid_alive, ActivityTracker};
use super::adapter::{Adapter, ExitFlag, SpawnOptions};
use super::approval::{ApprovalGateMap, Resolution};
use super::claude::ClaudeAdapter;
use super::codex::CodexAdapter;
use super::gemini::GeminiAdapter;
use super::log::SessionLog;
use super::types::{AgendoControl, AgendoEvent, AgendoEventKind, ApprovalDecision, SessionStatus};
use crate::config::{HotConfig, WorkerConfig};
use crate::ipc::event::{ControlBus, EventBus};
use crate::mailbox::{resolve_team_inbox, TeamInboxMonitor};
use crate::policy::risk::RiskDatabase;
use crate::scheduler::queue::{Slot, SlotQueue};
use crate::storage::Storage;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Guard env vars a child agent process would use to detect it's already
/// running nested inside a supervised session, and abort defensively.
const GUARD_ENV_VARS: &[&str] = &["AGENDO_SESSION_ID", "AGENDO_AGENT_ID", "AGENDO_TASK_ID"];

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub initial_prompt: String,
    pub resume_ref: Option<String>,
    pub cwd: PathBuf,
    pub env_overrides: HashMap<String, String>,
    pub mcp_config_path: Option<PathBuf>,
    pub mcp_servers: Vec<String>,
    pub initial_image: Option<PathBuf>,
    pub display_text: Option<String>,
}

/// Builds the concrete adapter for an agent id. The three variants share no
/// base implementation beyond the trait — this is the only place that
/// knows how to construct one.
fn build_adapter(
    agent_id: &str,
    session_id: String,
    storage: Arc<Storage>,
    event_bus: Arc<EventBus>,
    log: Arc<SessionLog>,
    approvals: Arc<ApprovalGateMap>,
) -> Result<Arc<dyn Adapter>> {
    match agent_id {
        "claude" => Ok(ClaudeAdapter::new(session_id, storage, event_bus, log, approvals)),
        "codex" => Ok(CodexAdapter::new(session_id, storage, event_bus, log, approvals)),
        "gemini" => Ok(GeminiAdapter::new(session_id, storage, event_bus, log)),
        other => Err(anyhow!("unknown agent id `{other}`")),
    }
}

pub struct SessionSupervisor {
    session_id: String,
    agent_id: String,
    worker_id: String,
    storage: Arc<Storage>,
    event_bus: Arc<EventBus>,
    control_bus: Arc<ControlBus>,
    slot_queue: Arc<SlotQueue>,
    risk_db: Arc<RiskDatabase>,
    config_dir: PathBuf,
    config: Arc<WorkerConfig>,
    hot_config: Option<Arc<RwLock<HotConfig>>>,

    log: Arc<SessionLog>,
    approvals: Arc<ApprovalGateMap>,
    adapter: Mutex<Option<Arc<dyn Adapter>>>,
    activity: Arc<ActivityTracker>,

    status: Mutex<SessionStatus>,
    active_tool_use_ids: Mutex<HashSet<String>>,
    mcp_servers: Mutex<Vec<String>>,
    mcp_healthy: Mutex<HashMap<String, bool>>,
    slot: Mutex<Option<Slot>>,
    terminating: AtomicBool,
    cancel_killed: AtomicBool,
    exit_handled: AtomicBool,

    exited: Notify,
    exited_flag: AtomicBool,
    slot_released: Notify,
    slot_released_flag: AtomicBool,
}

impl SessionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        agent_id: String,
        worker_id: String,
        storage: Arc<Storage>,
        event_bus: Arc<EventBus>,
        control_bus: Arc<ControlBus>,
        slot_queue: Arc<SlotQueue>,
        risk_db: Arc<RiskDatabase>,
        config_dir: PathBuf,
        idle_timeout: std::time::Duration,
        data_dir: &std::path::Path,
        config: Arc<WorkerConfig>,
        hot_config: Option<Arc<RwLock<HotConfig>>>,
    ) -> Arc<Self> {
        let log = Arc::new(SessionLog::new(data_dir, &session_id));
        let approvals = Arc::new(ApprovalGateMap::new(risk_db.clone()));
        Arc::new(Self {
            session_id,
            agent_id,
            worker_id,
            storage,
            event_bus,
            control_bus,
            slot_queue,
            risk_db,
            config_dir,
            config,
            hot_config,
            log,
            approvals,
            adapter: Mutex::new(None),
            activity: Arc::new(ActivityTracker::new(idle_timeout)),
            status: Mutex::new(SessionStatus::Idle),
            active_tool_use_ids: Mutex::new(HashSet::new()),
            mcp_servers: Mutex::new(Vec::new()),
            mcp_healthy: Mutex::new(HashMap::new()),
            slot: Mutex::new(None),
            terminating: AtomicBool::new(false),
            cancel_killed: AtomicBool::new(false),
            exit_handled: AtomicBool::new(false),
            exited: Notify::new(),
            exited_flag: AtomicBool::new(false),
            slot_released: Notify::new(),
            slot_released_flag: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `heartbeat_interval_secs` is a structural startup value, not part of
    /// the hot-reloaded subset — only `sigkill_grace_secs` and the idle
    /// timeout are watched.
    fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.heartbeat_interval_secs)
    }

    async fn sigkill_grace(&self) -> std::time::Duration {
        match &self.hot_config {
            Some(hot) => std::time::Duration::from_secs(hot.read().await.sigkill_grace_secs),
            None => std::time::Duration::from_secs(self.config.sigkill_grace_secs),
        }
    }

    /// Step 1 of `Start`: atomic claim. A zero-row CAS means the session is
    /// already claimed (by us or a racing caller) — the spec treats this as
    /// a no-op, not an error, and the caller still gets working exit/slot
    /// futures.
    async fn claim(&self) -> Result<bool> {
        self.storage.claim_session(&self.session_id, &self.worker_id).await
    }

    /// Entry point. Spawns the supervised run as a background task and
    /// returns once the claim outcome (won or lost) is known.
    pub async fn start(self: &Arc<Self>, opts: StartOptions) -> Result<()> {
        if !self.claim().await? {
            debug!(session_id = %self.session_id, "claim race lost — already active, resolving as no-op");
            self.finish_exit(SessionStatus::Active).await;
            return Ok(());
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(opts).await {
                error!(session_id = %this.session_id, error = %e, "supervisor run failed");
                let _ = this.storage.release_claim(&this.session_id, "ended").await;
                this.publish(AgendoEventKind::SystemError { message: e.to_string() }).await;
                this.finish_exit(SessionStatus::Ended).await;
            }
        });
        Ok(())
    }

    async fn run(self: &Arc<Self>, opts: StartOptions) -> Result<()> {
        let slot = self.slot_queue.acquire().await;
        *self.slot.lock().await = Some(slot);

        let row = self
            .storage
            .get_session(&self.session_id)
            .await?
            .ok_or_else(|| anyhow!("session row disappeared after claim"))?;

        self.storage.set_log_file_path(&self.session_id, &self.log.path().to_string_lossy()).await?;
        self.approvals.seed_allowed_tools(row.allowed_tools_vec()).await;

        let mut control_rx = self.control_bus.register(&self.session_id).await;

        let env = self.build_child_env(&opts.env_overrides);
        let spawn_opts = SpawnOptions {
            cwd: opts.cwd.clone(),
            env,
            execution_id: None,
            timeout_sec: None,
            max_output_bytes: None,
            persistent_session: true,
            permission_mode: row.permission_mode.clone(),
            allowed_tools: row.allowed_tools_vec(),
            extra_args: Vec::new(),
            mcp_config_path: opts.mcp_config_path.clone(),
            mcp_servers: opts.mcp_servers.clone(),
            initial_image: opts.initial_image.clone(),
            session_id: self.session_id.clone(),
            strict_mcp_config: opts.mcp_config_path.is_some(),
            model: row.model.clone(),
            max_budget_usd: None,
            fallback_model: None,
        };

        let adapter = build_adapter(
            &self.agent_id,
            self.session_id.clone(),
            self.storage.clone(),
            self.event_bus.clone(),
            self.log.clone(),
            self.approvals.clone(),
        )?;

        self.set_status(SessionStatus::Active).await?;

        if let Some(ref resume_ref) = opts.resume_ref {
            let display = opts.display_text.clone().unwrap_or_else(|| opts.initial_prompt.clone());
            self.publish(AgendoEventKind::UserMessage { text: display, image_ref: None }).await;
            adapter
                .resume(resume_ref, &opts.initial_prompt, spawn_opts)
                .await
                .context("adapter resume failed")?;
        } else {
            adapter
                .spawn(&opts.initial_prompt, spawn_opts)
                .await
                .context("adapter spawn failed")?;
        }

        if let Some(pid) = adapter.pid() {
            self.storage.set_pid(&self.session_id, pid as i64).await?;
        }
        *self.adapter.lock().await = Some(adapter.clone());

        self.start_team_monitor();

        let heartbeat = self.clone();
        let heartbeat_handle = tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        let idle = self.clone();
        let idle_handle = tokio::spawn(async move { idle.idle_loop().await });

        let exit_watch = self.clone();
        let exit_watch_adapter = adapter.clone();
        let exit_watch_handle = tokio::spawn(async move { exit_watch.exit_watch_loop(exit_watch_adapter).await });

        let tool_tracker = self.clone();
        let tool_tracker_handle = tokio::spawn(async move { tool_tracker.tool_tracker_loop().await });

        let mcp_probe = self.clone();
        let mcp_probe_adapter = adapter.clone();
        let mcp_probe_handle = tokio::spawn(async move { mcp_probe.mcp_probe_loop(mcp_probe_adapter).await });

        let result = self.control_loop(&mut control_rx, &adapter).await;
        self.control_bus.unregister(&self.session_id).await;
        heartbeat_handle.abort();
        idle_handle.abort();
        exit_watch_handle.abort();
        tool_tracker_handle.abort();
        mcp_probe_handle.abort();

        result
    }

    /// Observes every event published for this session — regardless of
    /// whether it came from `self.publish()` or an adapter's own
    /// `stamp_and_publish` — so `active_tool_use_ids` reflects tool calls
    /// the adapters report directly, not just ones this supervisor itself
    /// originates. This is what `drain_pending_approvals` on
    /// interrupt/cancel relies on to know which tool uses are outstanding.
    async fn tool_tracker_loop(self: Arc<Self>) {
        let mut rx = self.event_bus.subscribe(&self.session_id).await;
        loop {
            match rx.recv().await {
                Ok(event) => match event.kind {
                    AgendoEventKind::AgentToolStart { tool_use_id, .. } => {
                        self.active_tool_use_ids.lock().await.insert(tool_use_id);
                    }
                    AgendoEventKind::AgentToolEnd { tool_use_id, .. } => {
                        self.active_tool_use_ids.lock().await.remove(&tool_use_id);
                    }
                    AgendoEventKind::SessionInit { ref mcp_servers, .. } => {
                        *self.mcp_servers.lock().await = mcp_servers.clone();
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
            if self.exited_flag.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Polls the adapter's liveness at a much tighter interval than the
    /// heartbeat (which only needs to satisfy the 30s DB liveness column) so
    /// a normal child exit transitions the session promptly instead of
    /// waiting out the heartbeat period.
    async fn exit_watch_loop(self: Arc<Self>, adapter: Arc<dyn Adapter>) {
        const POLL: std::time::Duration = std::time::Duration::from_millis(300);
        loop {
            tokio::time::sleep(POLL).await;
            if self.exited_flag.load(Ordering::Acquire) {
                return;
            }
            if !adapter.is_alive() {
                let flag = adapter.exit_flag().await;
                self.handle_exit(flag, Some(-1)).await;
                return;
            }
        }
    }

    /// Periodic MCP liveness probe. MCP servers are subprocesses of the
    /// agent CLI child, not of this worker, so there's no pid to signal
    /// directly — the adapter's own liveness is the only handle we have.
    /// When the child dies, every MCP server it was hosting is reported
    /// unhealthy exactly once (on the transition), never re-announced on
    /// every subsequent tick.
    async fn mcp_probe_loop(self: Arc<Self>, adapter: Arc<dyn Adapter>) {
        let interval = self.heartbeat_interval();
        loop {
            tokio::time::sleep(interval).await;
            if self.exited_flag.load(Ordering::Acquire) {
                return;
            }
            let servers = self.mcp_servers.lock().await.clone();
            if servers.is_empty() {
                continue;
            }
            let healthy = adapter.is_alive();
            let mut seen = self.mcp_healthy.lock().await;
            for server in servers {
                let changed = seen.get(&server).copied() != Some(healthy);
                if changed {
                    seen.insert(server.clone(), healthy);
                    drop(seen);
                    self.publish(AgendoEventKind::SystemMcpStatus { server, healthy }).await;
                    seen = self.mcp_healthy.lock().await;
                }
            }
        }
    }

    fn build_child_env(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| !GUARD_ENV_VARS.contains(&k.as_str()))
            .collect();
        env.extend(overrides.clone());
        env.insert("SESSION_ID".to_string(), self.session_id.clone());
        env.insert("AGENT_ID".to_string(), self.agent_id.clone());
        env
    }

    fn start_team_monitor(self: &Arc<Self>) {
        let Some(inbox_path) = resolve_team_inbox(&self.config_dir, &self.session_id) else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let mut monitor = TeamInboxMonitor::start(inbox_path);
            loop {
                tokio::time::sleep(crate::mailbox::monitor::POLL_INTERVAL).await;
                if this.exited_flag.load(Ordering::Acquire) {
                    return;
                }
                for kind in monitor.poll() {
                    this.publish(kind).await;
                }
            }
        });
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.heartbeat_interval()).await;
            if self.exited_flag.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = self.storage.touch_heartbeat(&self.session_id).await {
                warn!(session_id = %self.session_id, error = %e, "heartbeat write failed");
            }
            let alive = {
                let guard = self.adapter.lock().await;
                guard.as_ref().map(|a| a.is_alive()).unwrap_or(false)
            };
            if !alive {
                self.handle_exit(ExitFlag::None, Some(-1)).await;
                return;
            }
        }
    }

    async fn idle_loop(self: Arc<Self>) {
        loop {
            self.activity.wait_for_idle().await;
            if self.exited_flag.load(Ordering::Acquire) {
                return;
            }
            let status = *self.status.lock().await;
            if status != SessionStatus::AwaitingInput {
                continue;
            }
            self.publish(AgendoEventKind::SystemInfo { message: "Session idle — terminating".to_string() }).await;
            let _ = self.terminate().await;
            return;
        }
    }

    async fn control_loop(
        self: &Arc<Self>,
        control_rx: &mut tokio::sync::mpsc::Receiver<AgendoControl>,
        adapter: &Arc<dyn Adapter>,
    ) -> Result<()> {
        loop {
            if self.exited_flag.load(Ordering::Acquire) {
                return Ok(());
            }
            match control_rx.recv().await {
                Some(control) => self.dispatch_control(control, adapter).await,
                None => return Ok(()),
            }
        }
    }

    async fn dispatch_control(self: &Arc<Self>, control: AgendoControl, adapter: &Arc<dyn Adapter>) {
        self.activity.record_activity();
        let result: Result<()> = match control {
            AgendoControl::Message { text, image_ref } => self.push_message_inner(adapter, &text, image_ref).await,
            AgendoControl::Cancel => {
                self.cancel_killed.store(true, Ordering::SeqCst);
                self.interrupt_inner(adapter).await
            }
            AgendoControl::Interrupt => self.interrupt_inner(adapter).await,
            AgendoControl::Redirect { text } => self.push_message_inner(adapter, &text, None).await,
            AgendoControl::ToolApproval { approval_id, decision, updated_input } => {
                self.approvals
                    .resolve(&approval_id, Resolution { decision, updated_input })
                    .await;
                Ok(())
            }
            AgendoControl::AnswerQuestion { approval_id, questions, answers } => {
                let payload = serde_json::json!({ "questions": questions, "answers": answers });
                self.approvals
                    .resolve(
                        &approval_id,
                        Resolution { decision: ApprovalDecision::Allow, updated_input: Some(payload) },
                    )
                    .await;
                Ok(())
            }
            AgendoControl::ToolResult { tool_use_id: _, content: _ } => {
                // Tool-result pushback is only meaningful for adapters that
                // model the result as a separate control message; none of
                // the three current adapters need this path yet.
                if !matches!(*self.status.lock().await, SessionStatus::Active | SessionStatus::AwaitingInput) {
                    warn!(session_id = %self.session_id, "tool-result control dropped — session not active");
                }
                Ok(())
            }
            AgendoControl::SetPermissionMode { mode } => {
                let r = adapter.set_permission_mode(&mode).await;
                if r.is_ok() {
                    let _ = self.storage.set_permission_mode(&self.session_id, &mode).await;
                }
                r
            }
            AgendoControl::SetModel { model } => {
                let r = adapter.set_model(&model).await;
                if r.is_ok() {
                    let _ = self.storage.set_model(&self.session_id, &model).await;
                }
                r
            }
        };
        if let Err(e) = result {
            warn!(session_id = %self.session_id, error = %e, "control dispatch failed");
        }
    }

    // ─── Public control surface ─────────────────────────────────────────

    pub async fn push_message(&self, text: &str, image: Option<PathBuf>) -> Result<()> {
        let status = *self.status.lock().await;
        if !matches!(status, SessionStatus::Active | SessionStatus::AwaitingInput) {
            bail!("push_message invalid in status {:?}", status);
        }
        let adapter = self.adapter.lock().await.clone().context("adapter not running")?;
        let image_ref = image.as_ref().map(|p| p.display().to_string());
        self.push_message_inner(&adapter, text, image_ref).await
    }

    /// Emits `user:message` and transitions to `active` **before** calling
    /// the adapter — some adapters' send is synchronous through the whole
    /// round-trip and would otherwise observe a stale status.
    async fn push_message_inner(
        &self,
        adapter: &Arc<dyn Adapter>,
        text: &str,
        image_ref: Option<String>,
    ) -> Result<()> {
        self.publish(AgendoEventKind::UserMessage { text: text.to_string(), image_ref: image_ref.clone() }).await;
        self.set_status(SessionStatus::Active).await?;
        self.activity.record_activity();
        let image = image_ref.map(PathBuf::from);
        adapter.send_message(text, image).await
    }

    pub async fn interrupt(&self) -> Result<()> {
        let adapter = self.adapter.lock().await.clone().context("adapter not running")?;
        self.interrupt_inner(&adapter).await
    }

    async fn interrupt_inner(&self, adapter: &Arc<dyn Adapter>) -> Result<()> {
        let ids: Vec<String> = self.active_tool_use_ids.lock().await.drain().collect();
        for id in ids {
            self.publish(AgendoEventKind::AgentToolEnd {
                tool_use_id: id,
                content: "[Interrupted by user]".to_string(),
                duration_ms: None,
                file_count: None,
                truncated: false,
                is_error: true,
            })
            .await;
        }
        self.approvals.drain_deny().await;
        adapter.interrupt().await?;
        self.schedule_sigkill_escalation(adapter.clone()).await;
        Ok(())
    }

    pub async fn terminate(&self) -> Result<()> {
        self.mark_terminating();
        let adapter = self.adapter.lock().await.clone();
        if let Some(adapter) = adapter {
            adapter.interrupt().await.ok();
            self.schedule_sigkill_escalation(adapter.clone()).await;
            #[cfg(unix)]
            if let Some(pid) = adapter.pid() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        Ok(())
    }

    pub fn mark_terminating(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.activity.mark_terminating();
    }

    async fn schedule_sigkill_escalation(&self, adapter: Arc<dyn Adapter>) {
        let grace = self.sigkill_grace().await;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(pid) = adapter.pid() {
                if adapter.is_alive() && is_pid_alive(pid as i32) {
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
        });
    }

    pub async fn wait_for_exit(&self) {
        while !self.exited_flag.load(Ordering::Acquire) {
            self.exited.notified().await;
        }
    }

    pub async fn wait_for_slot_release(&self) {
        while !self.slot_released_flag.load(Ordering::Acquire) && !self.exited_flag.load(Ordering::Acquire) {
            tokio::select! {
                _ = self.slot_released.notified() => {}
                _ = self.exited.notified() => {}
            }
        }
    }

    // ─── State transitions & exit handling ──────────────────────────────

    async fn set_status(&self, status: SessionStatus) -> Result<()> {
        *self.status.lock().await = status;
        self.storage.update_status(&self.session_id, status.as_str()).await?;
        self.publish(AgendoEventKind::SessionState { status }).await;
        if status == SessionStatus::AwaitingInput {
            self.release_slot().await;
            self.storage.reset_reenqueue_count(&self.session_id).await.ok();
        }
        Ok(())
    }

    async fn release_slot(&self) {
        if self.slot_released_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot_released.notify_waiters();
        if let Some(mut s) = self.slot.lock().await.take() {
            s.release();
        }
    }

    async fn publish(&self, kind: AgendoEventKind) {
        match kind {
            AgendoEventKind::AgentToolStart { ref tool_use_id, .. } => {
                self.active_tool_use_ids.lock().await.insert(tool_use_id.clone());
            }
            AgendoEventKind::AgentToolEnd { ref tool_use_id, .. } => {
                self.active_tool_use_ids.lock().await.remove(tool_use_id);
            }
            _ => {}
        }
        let id = match self.storage.next_event_seq(&self.session_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to allocate event seq");
                return;
            }
        };
        let event = AgendoEvent {
            id,
            session_id: self.session_id.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
            kind,
        };
        if let Err(e) = self.log.write_event(&event).await {
            warn!(session_id = %self.session_id, error = %e, "failed to write event to log");
        }
        self.event_bus.publish(event).await;
    }

    /// Dispatch on `ExitFlag`/exit-code per §4.1 failure semantics. Guarded
    /// idempotent: a second invocation with the same or different code
    /// produces the state/events of exactly one invocation.
    async fn handle_exit(self: &Arc<Self>, flag: ExitFlag, code: Option<i32>) {
        if self.exit_handled.swap(true, Ordering::SeqCst) {
            return;
        }

        let terminating = self.terminating.load(Ordering::SeqCst);
        let cancel_killed = self.cancel_killed.load(Ordering::SeqCst);

        if cancel_killed {
            self.finish_exit(SessionStatus::Ended).await;
            return;
        }

        match flag {
            ExitFlag::CancelKilled => {
                self.finish_exit(SessionStatus::Ended).await;
            }
            ExitFlag::TerminateKilled => {
                let _ = self.storage.release_claim(&self.session_id, "idle").await;
                self.finish_exit(SessionStatus::Idle).await;
            }
            ExitFlag::ModeChangeRestart => {
                let _ = self.storage.release_claim(&self.session_id, "idle").await;
                self.storage.increment_reenqueue_count(&self.session_id).await.ok();
                self.finish_exit(SessionStatus::Idle).await;
            }
            ExitFlag::ClearContextRestart => {
                let _ = self.storage.clear_session_ref(&self.session_id).await;
                let _ = self.storage.release_claim(&self.session_id, "idle").await;
                self.storage.increment_reenqueue_count(&self.session_id).await.ok();
                self.finish_exit(SessionStatus::Idle).await;
            }
            ExitFlag::None => {
                if terminating {
                    let _ = self.storage.release_claim(&self.session_id, "idle").await;
                    self.finish_exit(SessionStatus::Idle).await;
                    return;
                }
                match code {
                    Some(0) | None => {
                        let _ = self.storage.release_claim(&self.session_id, "idle").await;
                        self.finish_exit(SessionStatus::Idle).await;
                    }
                    Some(_) => {
                        self.publish(AgendoEventKind::SystemError {
                            message: "Session ended unexpectedly".to_string(),
                        })
                        .await;
                        let _ = self.storage.release_claim(&self.session_id, "ended").await;
                        self.finish_exit(SessionStatus::Ended).await;
                    }
                }
            }
        }
    }

    async fn finish_exit(self: &Arc<Self>, status: SessionStatus) {
        *self.status.lock().await = status;
        self.log.close().await;
        self.event_bus.remove(&self.session_id).await;
        self.release_slot().await;
        if !self.exited_flag.swap(true, Ordering::SeqCst) {
            self.exited.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_env_vars_are_well_known() {
        assert!(GUARD_ENV_VARS.contains(&"AGENDO_SESSION_ID"));
    }
}
