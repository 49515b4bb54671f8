//! The stable contract each agent implementation satisfies.
//!
//! Three variants back this trait: a NDJSON streaming CLI (claude), a
//! JSON-RPC/ACP client (codex), and a template-invoked one-shot CLI
//! (gemini). The supervisor only ever talks to `dyn Adapter`.

use crate::policy::risk::RiskLevel;
use crate::session::types::AgendoEventKind;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub execution_id: Option<String>,
    pub timeout_sec: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub persistent_session: bool,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub extra_args: Vec<String>,
    pub mcp_config_path: Option<PathBuf>,
    pub mcp_servers: Vec<String>,
    pub initial_image: Option<PathBuf>,
    pub session_id: String,
    pub strict_mcp_config: bool,
    pub model: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub fallback_model: Option<String>,
}

/// A pending approval request handed to the supervisor by the adapter when
/// it intercepts a tool-use block.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub ask_user_questions: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum ApprovalResolution {
    Allow { updated_input: Option<serde_json::Value> },
    Deny,
}

/// Callback surface the supervisor wires into an adapter before spawning.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, req: ApprovalRequest) -> ApprovalResolution;
    fn risk_of(&self, tool_name: &str) -> RiskLevel;
}

/// Reason the child exited, used by the supervisor's exit handler to pick
/// the right state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitFlag {
    #[default]
    None,
    CancelKilled,
    TerminateKilled,
    ModeChangeRestart,
    ClearContextRestart,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Start the child in a new process group.
    async fn spawn(&self, prompt: &str, opts: SpawnOptions) -> Result<()>;

    /// Restart from the adapter's notion of a prior session.
    async fn resume(&self, session_ref: &str, prompt: &str, opts: SpawnOptions) -> Result<()>;

    /// Push one turn into the running child.
    async fn send_message(&self, text: &str, image: Option<PathBuf>) -> Result<()>;

    /// Deliver a soft cancel (signal- or notification-based per variant).
    async fn interrupt(&self) -> Result<()>;

    async fn set_permission_mode(&self, mode: &str) -> Result<()>;

    /// On adapters where a model switch requires a process restart, the
    /// adapter tears itself down and re-establishes state internally.
    async fn set_model(&self, model: &str) -> Result<()>;

    /// Returns false once stdin is no longer writable.
    fn is_alive(&self) -> bool;

    /// Why the child last exited (or `None` if still running / a plain
    /// unexpected exit). Read by the supervisor's exit handler after
    /// `is_alive()` goes false.
    async fn exit_flag(&self) -> ExitFlag;

    /// Current PID, if spawned.
    fn pid(&self) -> Option<u32>;

    /// Pure transformation from an adapter-parsed record to zero or more
    /// canonical event payloads.
    fn map_json_to_events(&self, parsed: &serde_json::Value) -> Vec<AgendoEventKind>;
}
