//! RPC handlers for the tool-approval workflow (§4.5, §6).
//!
//! Exposes:
//!   `approval.respond`       — grant or deny a pending tool-use approval
//!   `approval.answerQuestion` — answer an `ask_user_question` prompt

use crate::session::types::{AgendoControl, ApprovalDecision};
use crate::AppContext;
use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
struct RespondParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "approvalId")]
    approval_id: String,
    decision: String,
    #[serde(rename = "updatedInput")]
    updated_input: Option<Value>,
}

/// Params: `{ sessionId, approvalId, decision: "allow"|"allow-session"|"deny", updatedInput? }`
pub async fn respond(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: RespondParams = serde_json::from_value(params)?;
    let decision = match p.decision.as_str() {
        "allow" => ApprovalDecision::Allow,
        "allow-session" => ApprovalDecision::AllowSession,
        "deny" => ApprovalDecision::Deny,
        other => bail!(
            "invalid type: unknown decision '{}' — must be allow, allow-session, or deny",
            other
        ),
    };

    let delivered = ctx
        .control_bus
        .send(
            &p.session_id,
            AgendoControl::ToolApproval { approval_id: p.approval_id, decision, updated_input: p.updated_input },
        )
        .await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}

#[derive(Deserialize)]
struct AnswerQuestionParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "approvalId")]
    approval_id: String,
    questions: Vec<String>,
    answers: Vec<String>,
}

pub async fn answer_question(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: AnswerQuestionParams = serde_json::from_value(params)?;
    let delivered = ctx
        .control_bus
        .send(
            &p.session_id,
            AgendoControl::AnswerQuestion { approval_id: p.approval_id, questions: p.questions, answers: p.answers },
        )
        .await;
    if !delivered {
        bail!("SESSION_NOT_FOUND: {} has no active supervisor", p.session_id);
    }
    Ok(json!({}))
}
