//! Adapter C: one-shot template CLI (`gemini`).
//!
//! No multi-turn, no approval gate, no session reference — each spawn runs
//! the child to completion and the supervisor tears the adapter down
//! immediately after the single `agent:result`.

use super::activity::is_pid_alive;
use super::adapter::{Adapter, ExitFlag, SpawnOptions};
use super::log::{SessionLog, Stream as LogStream};
use super::mapper::strip_annotation_prefix;
use super::types::{AgendoEvent, AgendoEventKind};
use crate::ipc::event::EventBus;
use crate::storage::Storage;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Inner {
    session_id: String,
    storage: Arc<Storage>,
    event_bus: Arc<EventBus>,
    log: Arc<SessionLog>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    alive: AtomicBool,
}

pub struct GeminiAdapter {
    inner: Arc<Inner>,
}

impl GeminiAdapter {
    pub fn new(
        session_id: String,
        storage: Arc<Storage>,
        event_bus: Arc<EventBus>,
        log: Arc<SessionLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                session_id,
                storage,
                event_bus,
                log,
                child: Mutex::new(None),
                pid: AtomicU32::new(0),
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

    async fn run_one_shot(self: &Arc<Self>, prompt: &str, opts: &SpawnOptions) -> Result<()> {
        let mut cmd = Command::new("gemini");
        cmd.args(["-p", prompt]);
        if let Some(ref model) = opts.model {
            cmd.args(["-m", model]);
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
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("failed to spawn `gemini` — is it installed and on PATH?")?;

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::Relaxed);
        self.alive.store(true, Ordering::Release);

        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;
        *self.child.lock().await = Some(child);

        self.spawn_stderr_drain(stderr);
        self.run_stdout_to_completion(stdout).await;
        self.on_child_exit().await;
        Ok(())
    }

    fn spawn_stderr_drain(self: &Arc<Self>, stderr: tokio::process::ChildStderr) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id = %this.session_id, "gemini stderr: {}", line);
                let _ = this.log.write_raw(LogStream::Stderr, &line).await;
            }
        });
    }

    /// No streaming protocol — the whole response is buffered and flushed
    /// as a single `agent:text` plus a synthetic `agent:result` once the
    /// process exits, since this adapter is one-shot.
    async fn run_stdout_to_completion(self: &Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut accumulated = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(raw_line)) => {
                    let _ = self.log.write_raw(LogStream::Stdout, &raw_line).await;
                    let text = strip_annotation_prefix(&raw_line);
                    accumulated.push_str(text);
                    accumulated.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "stdout read error");
                    break;
                }
            }
        }
        let trimmed = accumulated.trim_end().to_string();
        if !trimmed.is_empty() {
            self.stamp_and_publish(AgendoEventKind::AgentText { text: trimmed }).await;
        }
        self.stamp_and_publish(AgendoEventKind::AgentResult {
            is_error: false,
            subtype: "success".to_string(),
            cost_usd: None,
            turns: Some(1),
            duration_ms: None,
            duration_api_ms: None,
            model_usage: Default::default(),
            permission_denials: None,
            web_search_requests: None,
            errors: Vec::new(),
        })
        .await;
    }

    async fn on_child_exit(&self) {
        self.alive.store(false, Ordering::Release);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        self.pid.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    async fn spawn(&self, prompt: &str, opts: SpawnOptions) -> Result<()> {
        self.inner.run_one_shot(prompt, &opts).await
    }

    async fn resume(&self, _session_ref: &str, _prompt: &str, _opts: SpawnOptions) -> Result<()> {
        bail!("adapter C (gemini) has no session reference — resume is unsupported")
    }

    async fn send_message(&self, _text: &str, _image: Option<PathBuf>) -> Result<()> {
        bail!("adapter C (gemini) is one-shot — no multi-turn send")
    }

    async fn interrupt(&self) -> Result<()> {
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

    async fn set_permission_mode(&self, _mode: &str) -> Result<()> {
        Ok(())
    }

    async fn set_model(&self, _model: &str) -> Result<()> {
        bail!("adapter C (gemini) requires a fresh spawn to change model")
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
        ExitFlag::None
    }

    fn map_json_to_events(&self, _parsed: &Value) -> Vec<AgendoEventKind> {
        // Gemini is not a structured-JSON stream; mapping happens inline in
        // `run_stdout_to_completion` instead of through this pure hook.
        Vec::new()
    }
}
