//! Adapter B: JSON-RPC over stdio (`codex app-server`).
//!
//! Requests are correlated by numeric id through a pending-requests map;
//! on process exit every outstanding request is failed. Differentiated
//! timeouts apply per method class (§4.3): handshake 30s, prompt 10min,
//! everything else unbounded.

use super::activity::is_pid_alive;
use super::adapter::{Adapter, ExitFlag, SpawnOptions};
use super::approval::{ApprovalGateMap, Resolution};
use super::log::{SessionLog, Stream as LogStream};
use super::mapper::extract_ask_user_questions;
use super::types::{AgendoEvent, AgendoEventKind, ApprovalDecision};
use crate::ipc::event::EventBus;
use crate::storage::Storage;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(600);

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<Result<Value, String>>>>;

struct Inner {
    session_id: String,
    storage: Arc<Storage>,
    event_bus: Arc<EventBus>,
    log: Arc<SessionLog>,
    approvals: Arc<ApprovalGateMap>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pid: AtomicU32,
    next_id: AtomicI64,
    pending: PendingMap,
    cwd: Mutex<PathBuf>,
    alive: AtomicBool,
    exit_flag: Mutex<ExitFlag>,
}

pub struct CodexAdapter {
    inner: Arc<Inner>,
}

impl CodexAdapter {
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
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                cwd: Mutex::new(PathBuf::new()),
                alive: AtomicBool::new(false),
                exit_flag: Mutex::new(ExitFlag::None),
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

    async fn send_request(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        {
            let mut guard = self.stdin.lock().await;
            let stdin = guard.as_mut().context("codex stdin is closed")?;
            stdin.write_all(format!("{}\n", req).as_bytes()).await?;
        }

        let result = match timeout {
            Some(d) => tokio::time::timeout(d, rx)
                .await
                .map_err(|_| anyhow!("codex request `{method}` timed out"))?,
            None => rx.await.map_err(|_| anyhow!("codex adapter dropped before responding")),
        };
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(anyhow!("codex error: {msg}")),
            Err(e) => Err(e),
        }
    }

    async fn start_child(self: &Arc<Self>, opts: &SpawnOptions) -> Result<()> {
        *self.cwd.lock().await = opts.cwd.clone();

        let mut cmd = Command::new("codex");
        cmd.arg("app-server");
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
            .context("failed to spawn `codex` — is it installed and on PATH?")?;

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::Relaxed);
        self.alive.store(true, Ordering::Release);

        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;
        let stdin = child.stdin.take().context("no stdin")?;
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        self.spawn_stderr_drain(stderr);
        self.spawn_stdout_pipeline(stdout);

        self.send_request("initialize", json!({ "sessionId": self.session_id }), Some(HANDSHAKE_TIMEOUT))
            .await?;
        Ok(())
    }

    fn spawn_stderr_drain(self: &Arc<Self>, stderr: tokio::process::ChildStderr) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id = %this.session_id, "codex stderr: {}", line);
                let _ = this.log.write_raw(LogStream::Stderr, &line).await;
            }
        });
    }

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
            this.fail_all_pending("codex process exited").await;
            this.on_child_exit().await;
        });
    }

    async fn fail_all_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    async fn on_child_exit(&self) {
        self.alive.store(false, Ordering::Release);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        self.pid.store(0, Ordering::Relaxed);
    }

    async fn handle_line(self: &Arc<Self>, raw_line: &str) {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            return;
        }
        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                self.stamp_and_publish(AgendoEventKind::SystemInfo { message: trimmed.to_string() }).await;
                return;
            }
        };

        // A response to one of our own outbound requests.
        if let Some(id) = parsed.get("id").and_then(Value::as_i64) {
            if parsed.get("result").is_some() || parsed.get("error").is_some() {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let resolved = if let Some(err) = parsed.get("error") {
                        Err(err.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string())
                    } else {
                        Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = tx.send(resolved);
                    return;
                }
            }
        }

        // A server -> client request needing a response (permission / fs).
        if let (Some(method), Some(id)) = (parsed.get("method").and_then(Value::as_str), parsed.get("id")) {
            let method = method.to_string();
            let id = id.clone();
            let params = parsed.get("params").cloned().unwrap_or(Value::Null);
            self.handle_server_request(&method, id, params).await;
            return;
        }

        // A notification — map to canonical events.
        for kind in map_codex_notification(&parsed) {
            self.stamp_and_publish(kind).await;
        }
    }

    async fn handle_server_request(self: &Arc<Self>, method: &str, id: Value, params: Value) {
        let response_result = match method {
            "requestPermission" => self.handle_permission_request(&params).await,
            "readFile" => self.handle_read_file(&params).await,
            "writeFile" => self.handle_write_file(&params).await,
            other => {
                warn!(session_id = %self.session_id, method = other, "unhandled codex server request");
                Ok(Value::Null)
            }
        };
        let response = match response_result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(msg) => json!({ "jsonrpc": "2.0", "id": id, "error": { "message": msg } }),
        };
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let _ = stdin.write_all(format!("{}\n", response).as_bytes()).await;
        }
    }

    /// Translates codex's `{allow_once, reject_once, ...}` option set to
    /// canonical allow/deny, emitting synthetic tool-start/tool-end around
    /// the approval round-trip so the UI renders a tool card.
    async fn handle_permission_request(self: &Arc<Self>, params: &Value) -> Result<Value, String> {
        let tool_name = params.get("tool").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let tool_input = params.get("input").cloned().unwrap_or(Value::Null);
        let approval_id = params.get("callId").and_then(Value::as_str).unwrap_or("codex-approval").to_string();

        self.stamp_and_publish(AgendoEventKind::AgentToolStart {
            tool_use_id: approval_id.clone(),
            tool_name: tool_name.clone(),
            tool_input: tool_input.clone(),
        })
        .await;

        let danger_level = self.approvals.risk_of(&tool_name);
        let ask_user_questions = extract_ask_user_questions(&tool_name, &tool_input);
        self.stamp_and_publish(AgendoEventKind::AgentToolApproval {
            approval_id: approval_id.clone(),
            tool_name: tool_name.clone(),
            tool_input,
            danger_level,
            ask_user_questions,
        })
        .await;

        let rx = self.approvals.open(&approval_id, &tool_name).await;
        let resolution = rx.await.unwrap_or_else(|_| Resolution::deny());

        if resolution.decision == ApprovalDecision::AllowSession {
            self.approvals.mark_allowed(&tool_name).await;
            if let Err(e) = self.storage.allow_tool(&self.session_id, &tool_name).await {
                warn!(session_id = %self.session_id, error = %e, "failed to persist allow-session grant");
            }
        }

        self.stamp_and_publish(AgendoEventKind::AgentToolEnd {
            tool_use_id: approval_id,
            content: match resolution.decision {
                ApprovalDecision::Deny => "[denied]".to_string(),
                _ => "[approved]".to_string(),
            },
            duration_ms: None,
            file_count: None,
            truncated: false,
            is_error: resolution.decision == ApprovalDecision::Deny,
        })
        .await;

        let option = match resolution.decision {
            ApprovalDecision::Allow | ApprovalDecision::AllowSession => "allow_once",
            ApprovalDecision::Deny => "reject_once",
        };
        let mut response = json!({ "decision": option });
        if let Some(updated) = resolution.updated_input {
            response["updatedInput"] = updated;
        }
        Ok(response)
    }

    /// On read error, return empty content rather than propagating the
    /// error — codex treats an empty read as "file not present".
    async fn handle_read_file(&self, params: &Value) -> Result<Value, String> {
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        let base = self.cwd.lock().await.clone();
        let full = base.join(path);
        let content = tokio::fs::read_to_string(&full).await.unwrap_or_default();
        Ok(json!({ "content": content }))
    }

    /// On write error, ignore and report success — codex does not expect a
    /// failure path here and would otherwise abort the turn.
    async fn handle_write_file(&self, params: &Value) -> Result<Value, String> {
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        let content = params.get("content").and_then(Value::as_str).unwrap_or_default();
        let base = self.cwd.lock().await.clone();
        let full = base.join(path);
        if let Some(parent) = full.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let _ = tokio::fs::write(&full, content).await;
        Ok(json!({ "ok": true }))
    }
}

#[async_trait]
impl Adapter for CodexAdapter {
    async fn spawn(&self, prompt: &str, opts: SpawnOptions) -> Result<()> {
        self.inner.start_child(&opts).await?;
        // No retry on 429: codex appends the message to history before the
        // model call, so a retry would duplicate it — surface the error.
        self.inner
            .send_request("sendUserMessage", json!({ "text": prompt }), Some(PROMPT_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn resume(&self, session_ref: &str, prompt: &str, opts: SpawnOptions) -> Result<()> {
        self.inner.start_child(&opts).await?;
        self.inner
            .send_request("resumeSession", json!({ "sessionRef": session_ref }), Some(HANDSHAKE_TIMEOUT))
            .await?;
        self.inner
            .send_request("sendUserMessage", json!({ "text": prompt }), Some(PROMPT_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn send_message(&self, text: &str, image: Option<PathBuf>) -> Result<()> {
        let params = json!({ "text": text, "image": image.map(|p| p.display().to_string()) });
        self.inner.send_request("sendUserMessage", params, Some(PROMPT_TIMEOUT)).await?;
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        // Notification-based soft cancel — no response expected.
        let mut guard = self.inner.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let note = json!({ "jsonrpc": "2.0", "method": "interrupt", "params": {} });
            let _ = stdin.write_all(format!("{}\n", note).as_bytes()).await;
        }
        Ok(())
    }

    async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        self.inner.send_request("setPermissionMode", json!({ "mode": mode }), None).await?;
        Ok(())
    }

    async fn set_model(&self, _model: &str) -> Result<()> {
        // Model switch requires a process restart for this adapter; the
        // supervisor observes `ExitFlag::ModeChangeRestart` and re-enqueues.
        *self.inner.exit_flag.lock().await = ExitFlag::ModeChangeRestart;
        #[cfg(unix)]
        {
            let pid = self.inner.pid.load(Ordering::Relaxed);
            if pid != 0 {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        Ok(())
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
        map_codex_notification(parsed)
    }
}

/// Pure mapper for codex's notification stream (no id/result fields).
pub fn map_codex_notification(parsed: &Value) -> Vec<AgendoEventKind> {
    let mut out = Vec::new();
    match parsed.get("method").and_then(Value::as_str) {
        Some("agentMessage") => {
            if let Some(text) = parsed.pointer("/params/text").and_then(Value::as_str) {
                out.push(AgendoEventKind::AgentText { text: text.to_string() });
            }
        }
        Some("agentMessageDelta") => {
            if let Some(delta) = parsed.pointer("/params/delta").and_then(Value::as_str) {
                out.push(AgendoEventKind::AgentTextDelta { delta: delta.to_string() });
            }
        }
        Some("turnComplete") => {
            out.push(AgendoEventKind::AgentResult {
                is_error: parsed.pointer("/params/isError").and_then(Value::as_bool).unwrap_or(false),
                subtype: "success".to_string(),
                cost_usd: parsed.pointer("/params/costUsd").and_then(Value::as_f64),
                turns: None,
                duration_ms: parsed.pointer("/params/durationMs").and_then(Value::as_u64),
                duration_api_ms: None,
                model_usage: Default::default(),
                permission_denials: None,
                web_search_requests: None,
                errors: Vec::new(),
            });
        }
        Some("rateLimited") => {
            out.push(AgendoEventKind::SystemRateLimit {
                retry_after_secs: parsed.pointer("/params/retryAfterSecs").and_then(Value::as_u64),
                message: parsed.pointer("/params/message").and_then(Value::as_str).unwrap_or("rate limited").to_string(),
            });
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_agent_message_to_text() {
        let v = json!({"method":"agentMessage","params":{"text":"hi"}});
        let events = map_codex_notification(&v);
        assert!(matches!(events[0], AgendoEventKind::AgentText { .. }));
    }

    #[test]
    fn maps_rate_limited_notification() {
        let v = json!({"method":"rateLimited","params":{"retryAfterSecs":30,"message":"slow down"}});
        let events = map_codex_notification(&v);
        assert!(matches!(events[0], AgendoEventKind::SystemRateLimit { .. }));
    }

    #[test]
    fn unknown_notification_maps_to_nothing() {
        let v = json!({"method":"somethingElse"});
        assert!(map_codex_notification(&v).is_empty());
    }
}
