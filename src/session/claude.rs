//! Adapter A: NDJSON streaming CLI (`claude -p --output-format stream-json`).
//!
//! Honors `--resume <ref>` on first spawn only — once the child has reported
//! its own session id via `system/init`, later turns never re-pass it; the
//! running process already holds the conversation.

use super::activity::{is_pid_alive, SIGKILL_GRACE};
use super::adapter::{Adapter, ExitFlag, SpawnOptions};
use super::approval::{ApprovalGateMap, PlanModeOutcome, Resolution};
use super::log::{SessionLog, Stream as LogStream};
use super::mapper::{extract_ask_user_questions, extract_tool_result_text, parse_model_usage, strip_annotation_prefix};
use super::types::{AgendoEvent, AgendoEventKind, ApprovalDecision};
use crate::ipc::event::EventBus;
use crate::storage::Storage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Adapter A's mutable state, held behind an `Arc` so background pump tasks
/// can clone a `'static` handle independent of how callers hold the outer
/// `ClaudeAdapter` (as `&self` through the `Adapter` trait object, or not).
struct Inner {
    session_id: String,
    storage: Arc<Storage>,
    event_bus: Arc<EventBus>,
    log: Arc<SessionLog>,
    approvals: Arc<ApprovalGateMap>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pid: AtomicU32,
    session_ref: Mutex<Option<String>>,
    resumed_once: AtomicBool,
    active_tool_use_ids: Mutex<HashSet<String>>,
    exit_flag: Mutex<ExitFlag>,
    alive: AtomicBool,
}

pub struct ClaudeAdapter {
    inner: Arc<Inner>,
}

impl ClaudeAdapter {
    pub fn new(
        session_id: String,
        storage: Arc<Storage>,
        event_bus: Arc<EventBus>,
        log: Arc<SessionLog>,
        approvals: Arc<ApprovalGateMap>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                session_id,
                storage,
                event_bus,
                log,
                approvals,
                child: Mutex::new(None),
                stdin: Mutex::new(None),
                pid: AtomicU32::new(0),
                session_ref: Mutex::new(None),
                resumed_once: AtomicBool::new(false),
                active_tool_use_ids: Mutex::new(HashSet::new()),
                exit_flag: Mutex::new(ExitFlag::None),
                alive: AtomicBool::new(false),
            }),
        })
    }
}

impl Inner {
    async fn stamp_and_publish(&self, kind: AgendoEventKind) {
        let id = match self.storage.next_event_seq(&self.session_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to allocate event seq");
                return;
            }
        };
        let ts = chrono::Utc::now().timestamp_millis();
        let event = AgendoEvent {
            id,
            session_id: self.session_id.clone(),
            ts,
            kind,
        };
        if let Err(e) = self.log.write_event(&event).await {
            warn!(session_id = %self.session_id, error = %e, "failed to write event to log");
        }
        self.event_bus.publish(event).await;
    }

    async fn start_child(self: &Arc<Self>, cmd_line: Vec<String>, opts: &SpawnOptions, resume_ref: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("claude");
        cmd.args(["--output-format", "stream-json", "-p"]);
        cmd.args(&cmd_line);
        if !opts.allowed_tools.is_empty() {
            cmd.arg("--allowed-tools").arg(opts.allowed_tools.join(","));
        }
        if let Some(ref model) = opts.model {
            cmd.args(["--model", model]);
        }
        if let Some(ref mcp) = opts.mcp_config_path {
            cmd.arg("--mcp-config").arg(mcp);
        }
        if opts.strict_mcp_config {
            cmd.arg("--strict-mcp-config");
        }
        if let Some(sid) = resume_ref {
            if !self.resumed_once.load(Ordering::Acquire) {
                cmd.args(["--resume", sid]);
            }
        }
        cmd.args(&opts.extra_args);
        cmd.envs(&opts.env);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.as_std_mut().process_group(0);
        }

        let mut child = cmd
            .current_dir(&opts.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("failed to spawn `claude` — is it installed and on PATH?")?;

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::Relaxed);
        self.alive.store(true, Ordering::Release);
        self.resumed_once.store(true, Ordering::Release);

        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;
        let stdin = child.stdin.take().context("no stdin")?;
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        self.spawn_stderr_drain(stderr);
        self.spawn_stdout_pipeline(stdout);
        Ok(())
    }

    fn spawn_stderr_drain(self: &Arc<Self>, stderr: tokio::process::ChildStderr) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id = %this.session_id, "claude stderr: {}", line);
                let _ = this.log.write_raw(LogStream::Stderr, &line).await;
            }
        });
    }

    /// Drives the §4.2 `onData` pipeline: buffer trailing partial line,
    /// split on `\n`, classify/parse/map/publish each complete line.
    fn spawn_stdout_pipeline(self: &Arc<Self>, stdout: tokio::process::ChildStdout) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(raw_line)) => {
                        let _ = this.log.write_raw(LogStream::Stdout, &raw_line).await;
                        this.handle_line(&raw_line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session_id = %this.session_id, error = %e, "stdout read error");
                        break;
                    }
                }
            }
            this.on_child_exit().await;
        });
    }

    async fn handle_line(self: &Arc<Self>, raw_line: &str) {
        let line = strip_annotation_prefix(raw_line.trim());
        if line.is_empty() {
            return;
        }
        if !line.starts_with('{') {
            self.stamp_and_publish(AgendoEventKind::AgentText { text: line.to_string() }).await;
            return;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                self.stamp_and_publish(AgendoEventKind::SystemInfo { message: line.to_string() }).await;
                return;
            }
        };
        for kind in map_claude_event(&parsed) {
            self.process_mapped_event(kind).await;
        }
    }

    /// Tool-use events intercept into the approval gate before being
    /// republished as `agent:tool-approval`; everything else passes through.
    /// Every tool-use round-trips through the gate regardless of its danger
    /// level — `ApprovalGateMap::open` is what short-circuits session-wide
    /// grants, not this caller.
    async fn process_mapped_event(self: &Arc<Self>, kind: AgendoEventKind) {
        match kind {
            AgendoEventKind::AgentToolStart { tool_use_id, tool_name, tool_input } => {
                self.active_tool_use_ids.lock().await.insert(tool_use_id.clone());
                let danger_level = self.approvals.risk_of(&tool_name);
                self.stamp_and_publish(AgendoEventKind::AgentToolStart {
                    tool_use_id: tool_use_id.clone(),
                    tool_name: tool_name.clone(),
                    tool_input: tool_input.clone(),
                })
                .await;

                let ask_user_questions = extract_ask_user_questions(&tool_name, &tool_input);
                self.stamp_and_publish(AgendoEventKind::AgentToolApproval {
                    approval_id: tool_use_id.clone(),
                    tool_name: tool_name.clone(),
                    tool_input: tool_input.clone(),
                    danger_level,
                    ask_user_questions,
                })
                .await;
                let rx = self.approvals.open(&tool_use_id, &tool_name).await;
                let resolution = rx.await.unwrap_or_else(|_| Resolution::deny());
                if resolution.decision == ApprovalDecision::Deny {
                    warn!(session_id = %self.session_id, tool_use_id, "tool denied by approval gate");
                }
                if resolution.decision == ApprovalDecision::AllowSession {
                    self.approvals.mark_allowed(&tool_name).await;
                    if let Err(e) = self.storage.allow_tool(&self.session_id, &tool_name).await {
                        warn!(session_id = %self.session_id, error = %e, "failed to persist allow-session grant");
                    }
                }

                if tool_name == "ExitPlanMode" {
                    self.handle_exit_plan_mode(&tool_use_id, resolution).await;
                } else {
                    self.send_tool_permission_response(&tool_use_id, &resolution).await;
                }
            }
            AgendoEventKind::SessionInit { ref session_ref, .. } => {
                // Fires exactly once per adapter-assigned reference (§4.3 onSessionRef).
                let mut guard = self.session_ref.lock().await;
                if guard.is_none() {
                    *guard = Some(session_ref.clone());
                    drop(guard);
                    if let Err(e) = self.storage.set_session_ref(&self.session_id, session_ref).await {
                        warn!(session_id = %self.session_id, error = %e, "failed to persist session_ref");
                    }
                }
                self.stamp_and_publish(kind).await;
            }
            other => self.stamp_and_publish(other).await,
        }
    }

    async fn on_child_exit(self: &Arc<Self>) {
        self.alive.store(false, Ordering::Release);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        self.pid.store(0, Ordering::Relaxed);
    }

    async fn write_stdin_line(&self, msg: &Value) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().context("claude stdin is closed")?;
        stdin.write_all(format!("{}\n", msg).as_bytes()).await?;
        Ok(())
    }

    /// Forward the resolved decision (and any `updatedInput`) back to the
    /// running child so it can proceed with, or abandon, the tool call.
    async fn send_tool_permission_response(&self, tool_use_id: &str, resolution: &Resolution) {
        let behavior = match resolution.decision {
            ApprovalDecision::Deny => "deny",
            ApprovalDecision::Allow | ApprovalDecision::AllowSession => "allow",
        };
        let mut msg = serde_json::json!({
            "type": "control",
            "subtype": "tool_permission_response",
            "tool_use_id": tool_use_id,
            "behavior": behavior,
        });
        if let Some(updated) = &resolution.updated_input {
            msg["updated_input"] = updated.clone();
        }
        if let Err(e) = self.write_stdin_line(&msg).await {
            warn!(session_id = %self.session_id, tool_use_id, error = %e, "failed to forward tool permission response");
        }
    }

    /// ExitPlanMode has two outcomes depending on the resolved decision:
    /// deny means "clear context and restart with the plan as the new
    /// initial prompt" (option 1); allow means "continue in the requested
    /// permission mode" (option 2), with an optional `/compact` afterward.
    async fn handle_exit_plan_mode(self: &Arc<Self>, tool_use_id: &str, resolution: Resolution) {
        if resolution.decision == ApprovalDecision::Deny {
            let plan = resolution
                .updated_input
                .as_ref()
                .and_then(|v| v.get("plan"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let plan_file_path = self.log.path().with_extension("plan.md");
            if let Err(e) = tokio::fs::write(&plan_file_path, &plan).await {
                warn!(session_id = %self.session_id, error = %e, "failed to write plan file");
            }
            let plan_file_path = plan_file_path.to_string_lossy().to_string();
            let outcome = PlanModeOutcome::ClearContextRestart { plan_file_path: plan_file_path.clone() };
            self.send_tool_permission_response(tool_use_id, &Resolution::deny()).await;
            self.approvals.drain_deny().await;
            if let Err(e) = self.storage.set_plan_file_path(&self.session_id, Some(&plan_file_path)).await {
                warn!(session_id = %self.session_id, error = %e, "failed to persist plan file path");
            }
            if !plan.is_empty() {
                if let Err(e) = self.storage.set_initial_prompt(&self.session_id, &plan).await {
                    warn!(session_id = %self.session_id, error = %e, "failed to persist plan as initial prompt");
                }
            }
            debug!(session_id = %self.session_id, ?outcome, "exit plan mode: clear context and restart");
            *self.exit_flag.lock().await = ExitFlag::ClearContextRestart;
            self.terminate_self().await;
        } else {
            let new_permission_mode = resolution
                .updated_input
                .as_ref()
                .and_then(|v| v.get("permissionMode"))
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            let post_approval_compact = resolution
                .updated_input
                .as_ref()
                .and_then(|v| v.get("postApprovalCompact"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let outcome = PlanModeOutcome::ContinueWithModeChange {
                new_permission_mode: new_permission_mode.clone(),
                post_approval_compact,
            };
            debug!(session_id = %self.session_id, ?outcome, "exit plan mode: continue with mode change");
            self.send_tool_permission_response(tool_use_id, &resolution).await;
            let mode_msg = serde_json::json!({ "type": "control", "subtype": "set_permission_mode", "mode": new_permission_mode });
            if let Err(e) = self.write_stdin_line(&mode_msg).await {
                warn!(session_id = %self.session_id, error = %e, "failed to push permission mode change");
            }
            if post_approval_compact {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let compact_msg = serde_json::json!({
                    "type": "user",
                    "message": { "role": "user", "content": "/compact" },
                });
                if let Err(e) = self.write_stdin_line(&compact_msg).await {
                    warn!(session_id = %self.session_id, error = %e, "failed to push /compact");
                }
            }
        }
    }

    /// SIGTERM now, SIGKILL after the grace window if the child hasn't
    /// exited on its own.
    async fn terminate_self(self: &Arc<Self>) {
        #[cfg(unix)]
        {
            let pid = self.pid.load(Ordering::Relaxed);
            if pid != 0 {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SIGKILL_GRACE).await;
                    let pid = this.pid.load(Ordering::Relaxed);
                    if pid != 0 && is_pid_alive(pid as i32) {
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        }
                    }
                });
            }
        }
    }
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    async fn spawn(&self, prompt: &str, opts: SpawnOptions) -> Result<()> {
        self.inner.start_child(vec![prompt.to_string()], &opts, None).await
    }

    async fn resume(&self, session_ref: &str, prompt: &str, opts: SpawnOptions) -> Result<()> {
        self.inner
            .start_child(vec![prompt.to_string()], &opts, Some(session_ref))
            .await
    }

    async fn send_message(&self, text: &str, _image: Option<std::path::PathBuf>) -> Result<()> {
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard.as_mut().context("claude stdin is closed")?;
        let msg = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        });
        let line = format!("{}\n", msg);
        stdin.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let pid = self.inner.pid.load(Ordering::Relaxed);
            if pid != 0 {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGINT);
                }
            }
        }
        Ok(())
    }

    async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        let msg = serde_json::json!({ "type": "control", "subtype": "set_permission_mode", "mode": mode });
        self.inner.write_stdin_line(&msg).await
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        *self.inner.exit_flag.lock().await = ExitFlag::ModeChangeRestart;
        let msg = serde_json::json!({ "type": "control", "subtype": "set_model", "model": model });
        self.inner.write_stdin_line(&msg).await
    }

    fn is_alive(&self) -> bool {
        let pid = self.inner.pid.load(Ordering::Relaxed);
        self.inner.alive.load(Ordering::Acquire) && (pid == 0 || is_pid_alive(pid as i32))
    }

    fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::Relaxed) {
            0 => None,
            p => Some(p),
        }
    }

    async fn exit_flag(&self) -> ExitFlag {
        *self.inner.exit_flag.lock().await
    }

    fn map_json_to_events(&self, parsed: &Value) -> Vec<AgendoEventKind> {
        map_claude_event(parsed)
    }
}

/// Pure mapper for claude's `stream-json` wire format (§4.4).
pub fn map_claude_event(parsed: &Value) -> Vec<AgendoEventKind> {
    let mut out = Vec::new();
    match parsed.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            if let Some(blocks) = parsed.pointer("/message/content").and_then(Value::as_array) {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                out.push(AgendoEventKind::AgentText { text: text.to_string() });
                            }
                        }
                        Some("thinking") => {
                            if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                                out.push(AgendoEventKind::AgentThinking { text: text.to_string() });
                            }
                        }
                        Some("tool_use") => {
                            let tool_use_id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                            let tool_name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                            let tool_input = block.get("input").cloned().unwrap_or(Value::Null);
                            out.push(AgendoEventKind::AgentToolStart { tool_use_id, tool_name, tool_input });
                        }
                        _ => {}
                    }
                }
            }
        }
        Some("user") => {
            if let Some(blocks) = parsed.pointer("/message/content").and_then(Value::as_array) {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                        let tool_use_id = block.get("tool_use_id").and_then(Value::as_str).unwrap_or_default().to_string();
                        let content = block.get("content").cloned().unwrap_or(Value::Null);
                        let text = extract_tool_result_text(&content);
                        out.push(AgendoEventKind::AgentToolEnd {
                            tool_use_id,
                            content: text,
                            duration_ms: None,
                            file_count: None,
                            truncated: false,
                            is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                        });
                    }
                }
            }
        }
        Some("result") => {
            out.push(AgendoEventKind::AgentResult {
                is_error: parsed.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                subtype: parsed.get("subtype").and_then(Value::as_str).unwrap_or("success").to_string(),
                cost_usd: parsed.get("total_cost_usd").and_then(Value::as_f64),
                turns: parsed.get("num_turns").and_then(Value::as_u64),
                duration_ms: parsed.get("duration_ms").and_then(Value::as_u64),
                duration_api_ms: parsed.get("duration_api_ms").and_then(Value::as_u64),
                model_usage: parsed.get("modelUsage").map(parse_model_usage).unwrap_or_default(),
                permission_denials: parsed.get("permission_denials").and_then(Value::as_u64),
                web_search_requests: parsed.pointer("/server_tool_use/web_search_requests").and_then(Value::as_u64),
                errors: Vec::new(),
            });
        }
        Some("system") => {
            if parsed.get("subtype").and_then(Value::as_str) == Some("init") {
                out.push(AgendoEventKind::SessionInit {
                    session_ref: parsed.get("session_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    slash_commands: parsed
                        .get("slash_commands")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default(),
                    mcp_servers: parsed
                        .get("mcp_servers")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.get("name").and_then(Value::as_str).map(String::from)).collect())
                        .unwrap_or_default(),
                    tools: parsed
                        .get("tools")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default(),
                    cwd: parsed.get("cwd").and_then(Value::as_str).unwrap_or_default().to_string(),
                    api_key_source: parsed.get("apiKeySource").and_then(Value::as_str).map(String::from),
                    permission_mode: parsed.get("permissionMode").and_then(Value::as_str).unwrap_or("default").to_string(),
                    model: parsed.get("model").and_then(Value::as_str).map(String::from),
                });
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_assistant_text_block() {
        let v = serde_json::json!({"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}});
        let events = map_claude_event(&v);
        assert!(matches!(events[0], AgendoEventKind::AgentText { .. }));
    }

    #[test]
    fn maps_tool_use_to_tool_start() {
        let v = serde_json::json!({"type":"assistant","message":{"content":[
            {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}
        ]}});
        let events = map_claude_event(&v);
        match &events[0] {
            AgendoEventKind::AgentToolStart { tool_use_id, tool_name, .. } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(tool_name, "Bash");
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn maps_system_init_to_session_init() {
        let v = serde_json::json!({"type":"system","subtype":"init","session_id":"abc","cwd":"/tmp","permissionMode":"default"});
        let events = map_claude_event(&v);
        match &events[0] {
            AgendoEventKind::SessionInit { session_ref, .. } => assert_eq!(session_ref, "abc"),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn maps_result_to_agent_result() {
        let v = serde_json::json!({"type":"result","subtype":"success","is_error":false,"num_turns":3});
        let events = map_claude_event(&v);
        match &events[0] {
            AgendoEventKind::AgentResult { turns, is_error, .. } => {
                assert_eq!(*turns, Some(3));
                assert!(!is_error);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn unknown_type_maps_to_nothing() {
        let v = serde_json::json!({"type":"bogus"});
        assert!(map_claude_event(&v).is_empty());
    }
}
