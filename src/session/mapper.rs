//! Pure per-adapter mapping functions: `(parsedWireEvent) -> [AgendoEventKind]`.
//!
//! Each function here is a pure, allocation-only transformation with no I/O
//! and no side effects — the supervisor stamps `id`/`sessionId`/`ts` after
//! the mapper returns. Keeping these pure is what makes them unit-testable
//! without a running child process.

use crate::session::types::{AgendoEventKind, ModelUsage};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Strips a nested tool-call annotation prefix such as `/server[stdout] `
/// or `/server[stderr] ` before the remainder is JSON-parsed.
static ANNOTATION_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/[^\[\s]+\[(stdout|stderr)\]\s?").unwrap());

pub fn strip_annotation_prefix(line: &str) -> &str {
    match ANNOTATION_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// `tool_result.content` may be a string, an array of content blocks, or a
/// single image block. Returns the joined text per the boundary rule:
/// string -> as-is; array -> join text-typed blocks with `\n`, falling back
/// to `serde_json::to_string` for non-text shapes.
pub fn extract_tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                } else {
                    parts.push(item.to_string());
                }
            }
            parts.join("\n")
        }
        other => other.to_string(),
    }
}

/// Parse a `modelUsage` map, defaulting any absent cache fields to 0. Model
/// names are an open extension point (unknown keys pass through).
pub fn parse_model_usage(value: &Value) -> HashMap<String, ModelUsage> {
    let mut out = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (model, entry) in obj {
            let usage = ModelUsage {
                input_tokens: entry.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: entry.get("outputTokens").and_then(Value::as_u64).unwrap_or(0),
                cache_read_input_tokens: entry
                    .get("cacheReadInputTokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                cache_creation_input_tokens: entry
                    .get("cacheCreationInputTokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                cost_usd: entry.get("costUSD").or_else(|| entry.get("costUsd")).and_then(Value::as_f64).unwrap_or(0.0),
                context_window: entry.get("contextWindow").and_then(Value::as_u64),
                max_output_tokens: entry.get("maxOutputTokens").and_then(Value::as_u64),
            };
            out.insert(model.clone(), usage);
        }
    }
    out
}

/// Extract the question list for an ask-user-style tool (e.g. Claude Code's
/// `AskUserQuestion`), so the `agent:tool-approval` event can carry the
/// questions for the UI to render input fields. `None` for any other tool.
pub fn extract_ask_user_questions(tool_name: &str, tool_input: &Value) -> Option<Vec<String>> {
    if tool_name != "AskUserQuestion" {
        return None;
    }
    let questions = tool_input.get("questions").and_then(Value::as_array)?;
    let out: Vec<String> = questions
        .iter()
        .filter_map(|q| q.as_str().map(String::from).or_else(|| q.get("question").and_then(Value::as_str).map(String::from)))
        .collect();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Map a single content block from Claude's `assistant` message array.
/// Returns `None` for block types that carry no user-visible event on
/// their own (e.g. a `tool_use` block — start events are emitted by the
/// caller once `toolUseId` bookkeeping is available).
pub fn map_text_block(block: &Value) -> Option<AgendoEventKind> {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => block
            .get("text")
            .and_then(Value::as_str)
            .map(|t| AgendoEventKind::AgentText { text: t.to_string() }),
        Some("thinking") => block
            .get("thinking")
            .and_then(Value::as_str)
            .map(|t| AgendoEventKind::AgentThinking { text: t.to_string() }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_stdout_annotation() {
        assert_eq!(strip_annotation_prefix("/fs[stdout] {\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn strips_stderr_annotation() {
        assert_eq!(strip_annotation_prefix("/net[stderr] oops"), "oops");
    }

    #[test]
    fn leaves_unannotated_lines_alone() {
        assert_eq!(strip_annotation_prefix("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn tool_result_string_passthrough() {
        let v = Value::String("plain".into());
        assert_eq!(extract_tool_result_text(&v), "plain");
    }

    #[test]
    fn tool_result_array_joins_text_blocks() {
        let v = serde_json::json!([{"type":"text","text":"a"}, {"type":"text","text":"b"}]);
        assert_eq!(extract_tool_result_text(&v), "a\nb");
    }

    #[test]
    fn tool_result_array_falls_back_to_json_for_non_text() {
        let v = serde_json::json!([{"type":"image","source":{"data":"abc"}}]);
        let out = extract_tool_result_text(&v);
        assert!(out.contains("image"));
    }

    #[test]
    fn ask_user_question_extracts_question_list() {
        let input = serde_json::json!({"questions": ["left or right?", "now or later?"]});
        let out = extract_ask_user_questions("AskUserQuestion", &input).unwrap();
        assert_eq!(out, vec!["left or right?".to_string(), "now or later?".to_string()]);
    }

    #[test]
    fn non_ask_user_tool_yields_no_questions() {
        assert!(extract_ask_user_questions("Bash", &serde_json::json!({"command": "ls"})).is_none());
    }

    #[test]
    fn model_usage_missing_cache_fields_default_to_zero() {
        let v = serde_json::json!({"M1": {"inputTokens": 5, "outputTokens": 1, "costUSD": 0.1}});
        let usages = parse_model_usage(&v);
        let m1 = &usages["M1"];
        assert_eq!(m1.cache_read_input_tokens, 0);
        assert_eq!(m1.cache_creation_input_tokens, 0);
        assert_eq!(m1.input_tokens, 5);
    }
}
