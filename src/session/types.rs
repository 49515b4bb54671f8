//! Canonical event/control discriminated unions.
//!
//! `AgendoEvent` is the append-only, outbound wire format published to the
//! event bus and written to the session log. `AgendoControl` is the inbound
//! control-channel format. Both use `#[serde(tag = "type")]` so the JSON
//! discriminator round-trips verbatim.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingInput,
    Idle,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingInput => "awaiting_input",
            Self::Idle => "idle",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "awaiting_input" => Some(Self::AwaitingInput),
            "idle" => Some(Self::Idle),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A single per-model token/cost accounting entry. Unknown model names are
/// permitted as map keys (open extension point); absent cache fields
/// default to 0 per the mapper's edge-case handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

/// Canonical, append-only event. `id` is the session's `eventSeq` at
/// publication time and is assigned by the supervisor, never the mapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgendoEventKind {
    #[serde(rename = "agent:text")]
    AgentText { text: String },
    #[serde(rename = "agent:text-delta")]
    AgentTextDelta { delta: String },
    #[serde(rename = "agent:thinking")]
    AgentThinking { text: String },
    #[serde(rename = "agent:thinking-delta")]
    AgentThinkingDelta { delta: String },
    #[serde(rename = "agent:tool-start")]
    AgentToolStart {
        tool_use_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },
    #[serde(rename = "agent:tool-end")]
    AgentToolEnd {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_count: Option<u64>,
        #[serde(default)]
        truncated: bool,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "agent:tool-approval")]
    AgentToolApproval {
        approval_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
        danger_level: DangerLevel,
        #[serde(skip_serializing_if = "Option::is_none")]
        ask_user_questions: Option<Vec<String>>,
    },
    #[serde(rename = "agent:result")]
    AgentResult {
        is_error: bool,
        subtype: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        turns: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_api_ms: Option<u64>,
        #[serde(default)]
        model_usage: std::collections::HashMap<String, ModelUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_denials: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        web_search_requests: Option<u64>,
        #[serde(default)]
        errors: Vec<String>,
    },
    #[serde(rename = "agent:activity")]
    AgentActivity { thinking: bool },
    #[serde(rename = "session:init")]
    SessionInit {
        session_ref: String,
        #[serde(default)]
        slash_commands: Vec<String>,
        #[serde(default)]
        mcp_servers: Vec<String>,
        #[serde(default)]
        tools: Vec<String>,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        api_key_source: Option<String>,
        permission_mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    #[serde(rename = "session:state")]
    SessionState { status: SessionStatus },
    #[serde(rename = "user:message")]
    UserMessage {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_ref: Option<String>,
    },
    #[serde(rename = "system:info")]
    SystemInfo { message: String },
    #[serde(rename = "system:error")]
    SystemError { message: String },
    #[serde(rename = "system:mcp-status")]
    SystemMcpStatus { server: String, healthy: bool },
    #[serde(rename = "system:rate-limit")]
    SystemRateLimit {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
        message: String,
    },
    #[serde(rename = "team:message")]
    TeamMessage {
        author: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_payload: Option<serde_json::Value>,
    },
}

/// Envelope stamped by the supervisor around a pure mapper-produced
/// [`AgendoEventKind`]. This is the unit actually published + logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendoEvent {
    pub id: i64,
    pub session_id: String,
    pub ts: i64,
    #[serde(flatten)]
    pub kind: AgendoEventKind,
}

impl AgendoEvent {
    /// `[<id>|<type>] <json>` — the body format written by the log writer
    /// for canonical events (as opposed to raw child stdout/stderr lines).
    pub fn log_body(&self) -> String {
        let tag = self.kind.type_tag();
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("[{}|{}] {}", self.id, tag, json)
    }
}

impl AgendoEventKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::AgentText { .. } => "agent:text",
            Self::AgentTextDelta { .. } => "agent:text-delta",
            Self::AgentThinking { .. } => "agent:thinking",
            Self::AgentThinkingDelta { .. } => "agent:thinking-delta",
            Self::AgentToolStart { .. } => "agent:tool-start",
            Self::AgentToolEnd { .. } => "agent:tool-end",
            Self::AgentToolApproval { .. } => "agent:tool-approval",
            Self::AgentResult { .. } => "agent:result",
            Self::AgentActivity { .. } => "agent:activity",
            Self::SessionInit { .. } => "session:init",
            Self::SessionState { .. } => "session:state",
            Self::UserMessage { .. } => "user:message",
            Self::SystemInfo { .. } => "system:info",
            Self::SystemError { .. } => "system:error",
            Self::SystemMcpStatus { .. } => "system:mcp-status",
            Self::SystemRateLimit { .. } => "system:rate-limit",
            Self::TeamMessage { .. } => "team:message",
        }
    }

    /// Deltas are not durably logged — the subsequent complete
    /// `agent:text`/`agent:thinking` replaces them on the consumer side.
    pub fn is_delta(&self) -> bool {
        matches!(self, Self::AgentTextDelta { .. } | Self::AgentThinkingDelta { .. })
    }
}

/// Inbound control-channel message. No sequence number — latest-wins per
/// variant where the supervisor's handling implies that semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgendoControl {
    Message {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_ref: Option<String>,
    },
    Cancel,
    Interrupt,
    Redirect { text: String },
    ToolApproval {
        approval_id: String,
        decision: ApprovalDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<serde_json::Value>,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    AnswerQuestion {
        approval_id: String,
        questions: Vec<String>,
        answers: Vec<String>,
    },
    SetPermissionMode { mode: String },
    SetModel { model: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    Allow,
    AllowSession,
    Deny,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips() {
        let ev = AgendoEvent {
            id: 1,
            session_id: "s1".into(),
            ts: 1000,
            kind: AgendoEventKind::AgentText { text: "hi".into() },
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: AgendoEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, ev.id);
        assert_eq!(back.kind.type_tag(), "agent:text");
    }

    #[test]
    fn control_tags_are_kebab_case() {
        let c = AgendoControl::SetPermissionMode { mode: "plan".into() };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "set-permission-mode");
    }

    #[test]
    fn log_body_carries_id_and_tag() {
        let ev = AgendoEvent {
            id: 7,
            session_id: "s1".into(),
            ts: 1,
            kind: AgendoEventKind::SystemInfo { message: "hi".into() },
        };
        let body = ev.log_body();
        assert!(body.starts_with("[7|system:info] "));
    }

    #[test]
    fn model_usage_defaults_absent_cache_fields_to_zero() {
        let json = serde_json::json!({"inputTokens": 10, "outputTokens": 2, "costUsd": 0.01});
        let usage: ModelUsage = serde_json::from_value(json).unwrap();
        assert_eq!(usage.cache_read_input_tokens, 0);
        assert_eq!(usage.cache_creation_input_tokens, 0);
    }
}
