//! Tool risk classification — maps tool names to a danger level.
//!
//! `RiskDatabase` is loaded once at worker start from an on-disk JSON file
//! (if present) and falls back to `RiskDatabase::default_rules()` for any
//! unknown tool. The danger level drives `agent:tool-approval`'s
//! `dangerLevel` field.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

/// Shared with the canonical event payload — a tool's risk *is* the
/// `dangerLevel` surfaced to the user in the approval card.
pub type RiskLevel = crate::session::types::DangerLevel;

#[derive(Debug, Clone, Default)]
pub struct RiskDatabase {
    rules: HashMap<String, RiskLevel>,
}

/// JSON shape expected in the on-disk override file.
#[derive(Debug, Deserialize)]
struct RiskConfigFile {
    #[serde(default)]
    low: Vec<String>,
    #[serde(default)]
    medium: Vec<String>,
    #[serde(default)]
    high: Vec<String>,
    #[serde(default)]
    critical: Vec<String>,
}

impl RiskDatabase {
    /// Hardcoded default risk rules for the built-in agent CLI tools.
    pub fn default_rules() -> Self {
        let mut rules = HashMap::new();

        for tool in &["Read", "Glob", "Grep", "WebFetch", "LS"] {
            rules.insert((*tool).to_string(), RiskLevel::Low);
        }

        for tool in &["Write", "Edit", "NotebookEdit", "Task"] {
            rules.insert((*tool).to_string(), RiskLevel::Medium);
        }

        for tool in &["Bash", "git_commit", "apply_patch"] {
            rules.insert((*tool).to_string(), RiskLevel::High);
        }

        for tool in &["git_push", "shell_exec", "network_request"] {
            rules.insert((*tool).to_string(), RiskLevel::Critical);
        }

        Self { rules }
    }

    /// Load a risk database from a JSON file.
    ///
    /// Missing or malformed files emit a warning and return the default
    /// rules; unknown tools always fall back to the default rather than
    /// erroring.
    pub fn load_from_json(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "tool-risk.json not found — using defaults");
                return Self::default_rules();
            }
        };

        let config: RiskConfigFile = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, "tool-risk.json parse error — using defaults");
                return Self::default_rules();
            }
        };

        let mut db = Self::default_rules();
        for tool in config.low {
            db.rules.insert(tool, RiskLevel::Low);
        }
        for tool in config.medium {
            db.rules.insert(tool, RiskLevel::Medium);
        }
        for tool in config.high {
            db.rules.insert(tool, RiskLevel::High);
        }
        for tool in config.critical {
            db.rules.insert(tool, RiskLevel::Critical);
        }
        db
    }

    /// Return the danger level for the given tool name. Defaults to
    /// `Medium` for unrecognized tools.
    pub fn get_risk(&self, tool: &str) -> RiskLevel {
        self.rules.get(tool).copied().unwrap_or(RiskLevel::Medium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_low_risk() {
        let db = RiskDatabase::default_rules();
        assert_eq!(db.get_risk("Read"), RiskLevel::Low);
        assert_eq!(db.get_risk("Grep"), RiskLevel::Low);
    }

    #[test]
    fn default_rules_medium_risk() {
        let db = RiskDatabase::default_rules();
        assert_eq!(db.get_risk("Write"), RiskLevel::Medium);
        assert_eq!(db.get_risk("Edit"), RiskLevel::Medium);
    }

    #[test]
    fn default_rules_high_risk() {
        let db = RiskDatabase::default_rules();
        assert_eq!(db.get_risk("Bash"), RiskLevel::High);
    }

    #[test]
    fn default_rules_critical() {
        let db = RiskDatabase::default_rules();
        assert_eq!(db.get_risk("git_push"), RiskLevel::Critical);
        assert_eq!(db.get_risk("shell_exec"), RiskLevel::Critical);
    }

    #[test]
    fn unknown_tool_defaults_to_medium() {
        let db = RiskDatabase::default_rules();
        assert_eq!(db.get_risk("some_new_tool_xyz"), RiskLevel::Medium);
    }

    #[test]
    fn json_override_adds_new_tool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool-risk.json");
        std::fs::write(&path, r#"{"critical":["CustomDangerousTool"]}"#).unwrap();
        let db = RiskDatabase::load_from_json(&path);
        assert_eq!(db.get_risk("CustomDangerousTool"), RiskLevel::Critical);
        assert_eq!(db.get_risk("Read"), RiskLevel::Low);
    }
}
