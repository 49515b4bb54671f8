use crate::session::supervisor::{SessionSupervisor, StartOptions};
use crate::session::types::AgendoControl;
use crate::AppContext;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const VALID_AGENTS: &[&str] = &["claude", "codex", "gemini"];

fn default_permission_mode() -> String {
    "default".to_string()
}

#[derive(Deserialize)]
struct CreateParams {
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(rename = "capabilityId", default)]
    capability_id: String,
    #[serde(rename = "projectId")]
    project_id: Option<String>,
    #[serde(rename = "taskId")]
    task_id: Option<String>,
    cwd: String,
    #[serde(rename = "initialPrompt")]
    initial_prompt: String,
    #[serde(rename = "permissionMode", default = "default_permission_mode")]
    permission_mode: String,
    title: Option<String>,
    #[serde(rename = "resumeRef")]
    resume_ref: Option<String>,
    #[serde(rename = "mcpConfigPath")]
    mcp_config_path: Option<String>,
    #[serde(rename = "mcpServers", default)]
    mcp_servers: Vec<String>,
    #[serde(rename = "initialImage")]
    initial_image: Option<String>,
    #[serde(rename = "displayText")]
    display_text: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Deserialize)]
struct SessionIdParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Deserialize)]
struct SendMessageParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    text: String,
    #[serde(rename = "imageRef")]
    image_ref: Option<String>,
}

#[derive(Deserialize)]
struct SetPermissionModeParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    mode: String,
}

#[derive(Deserialize)]
struct SetModelParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    model: String,
}

/// `session.create` — claim a slot, create the session row, and start its
/// supervisor. The initial spawn/resume runs in the background; the caller
/// gets the row back immediately and follows the session's event stream
/// (the SSE log endpoint) for progress.
pub async fn create(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: CreateParams = serde_json::from_value(params)?;

    if !VALID_AGENTS.contains(&p.agent_id.as_str()) {
        bail!(
            "invalid type: unknown agent '{}' — must be one of: {}",
            p.agent_id,
            VALID_AGENTS.join(", ")
        );
    }
    if !std::path::Path::new(&p.cwd).exists() {
        bail!("cwd does not exist: {}", p.cwd);
    }
    if ctx.slot_queue.available() == 0 {
        bail!(
            "SESSION_LIMIT_REACHED: no free session slots ({} max)",
            ctx.slot_queue.capacity()
        );
    }

    let id = uuid::Uuid::new_v4().to_string();
    let row = ctx
        .storage
        .create_session(
            &id,
            &p.agent_id,
            &p.capability_id,
            p.project_id.as_deref(),
            p.task_id.as_deref(),
            &p.permission_mode,
            &p.initial_prompt,
            ctx.config.idle_timeout_secs as i64,
            p.title.as_deref(),
        )
        .await?;

    let supervisor = SessionSupervisor::new(
        id.clone(),
        p.agent_id.clone(),
        ctx.config.worker_id.clone(),
        ctx.storage.clone(),
        ctx.event_bus.clone(),
        ctx.control_bus.clone(),
        ctx.slot_queue.clone(),
        ctx.risk_db.clone(),
        ctx.config.data_dir.clone(),
        ctx.config.idle_timeout(),
        &ctx.config.data_dir,
        ctx.config.clone(),
        ctx.hot_config.clone(),
    );

    let opts = StartOptions {
        initial_prompt: p.initial_prompt,
        resume_ref: p.resume_ref,
        cwd: PathBuf::from(&p.cwd),
        env_overrides: p.env,
        mcp_config_path: p.mcp_config_path.map(PathBuf::from),
        mcp_servers: p.mcp_servers,
        initial_image: p.initial_image.map(PathBuf::from),
        display_text: p.display_text,
    };

    supervisor.start(opts).await.context("failed to start session")?;
    ctx.register_supervisor(supervisor, ctx.clone()).await;

    Ok(serde_json::to_value(&row)?)
}

pub async fn list(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let sessions = ctx.storage.list_sessions().await?;
    Ok(json!(sessions))
}

pub async fn get(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    let session = ctx
        .storage
        .get_session(&p.session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND: {}", p.session_id))?;
    Ok(json!(session))
}

/// `session.terminate` — graceful shutdown of a running session (SIGINT,
/// escalating to SIGKILL after the configured grace period). No-op error if
/// the session has no active supervisor (already idle/ended).
pub async fn terminate(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    let supervisor = ctx
        .get_supervisor(&p.session_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id))?;
    supervisor.terminate().await?;
    Ok(json!({}))
}

pub async fn delete(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    if ctx.get_supervisor(&p.session_id).await.is_some() {
        bail!("SESSION_BUSY: session is still running — terminate it first");
    }
    ctx.storage.delete_session(&p.session_id).await?;
    Ok(json!({}))
}

pub async fn send_message(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SendMessageParams = serde_json::from_value(params)?;
    let delivered = ctx
        .control_bus
        .send(&p.session_id, AgendoControl::Message { text: p.text, image_ref: p.image_ref })
        .await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}

pub async fn interrupt(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    let delivered = ctx.control_bus.send(&p.session_id, AgendoControl::Interrupt).await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}

pub async fn cancel(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SessionIdParams = serde_json::from_value(params)?;
    let delivered = ctx.control_bus.send(&p.session_id, AgendoControl::Cancel).await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}

pub async fn set_permission_mode(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SetPermissionModeParams = serde_json::from_value(params)?;
    let delivered = ctx
        .control_bus
        .send(&p.session_id, AgendoControl::SetPermissionMode { mode: p.mode })
        .await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}

pub async fn set_model(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SetModelParams = serde_json::from_value(params)?;
    let delivered = ctx.control_bus.send(&p.session_id, AgendoControl::SetModel { model: p.model }).await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}
