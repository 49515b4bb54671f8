//! Polling-based team inbox watcher.
//!
//! Unlike a filesystem-event watch, the inbox is polled on a fixed
//! interval and new messages are detected purely by array-length delta —
//! no timestamps or message ids are required on the wire format.

use crate::session::types::AgendoEventKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct TeamConfig {
    /// Session ids that are members of this team; any one of them may host
    /// the monitor that tails `inbox_path`.
    members: Vec<String>,
    inbox_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
struct InboxEntry {
    #[serde(default = "default_author")]
    author: String,
    text: String,
}

fn default_author() -> String {
    "teammate".to_string()
}

/// Scan `{config_dir}/teams/*.json` for a team config that lists
/// `session_id` as a member. Returns the leader inbox path if found.
pub fn resolve_team_inbox(config_dir: &Path, session_id: &str) -> Option<PathBuf> {
    let teams_dir = config_dir.join("teams");
    let entries = std::fs::read_dir(&teams_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(config) = serde_json::from_str::<TeamConfig>(&contents) else {
            continue;
        };
        if config.members.iter().any(|m| m == session_id) {
            return Some(config.inbox_path);
        }
    }
    None
}

fn read_entries(path: &Path) -> Vec<InboxEntry> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// A running inbox monitor for one session. `last_len` snapshots the
/// current length on start so pre-existing messages are not re-fired.
pub struct TeamInboxMonitor {
    inbox_path: PathBuf,
    last_len: usize,
}

impl TeamInboxMonitor {
    pub fn start(inbox_path: PathBuf) -> Self {
        let last_len = read_entries(&inbox_path).len();
        debug!(path = %inbox_path.display(), start_len = last_len, "team inbox monitor attached");
        Self { inbox_path, last_len }
    }

    /// Poll once; returns canonical events for any entries appended since
    /// the last poll (or since start). Structured (JSON-parseable) text is
    /// carried as `structuredPayload` alongside the raw text.
    pub fn poll(&mut self) -> Vec<AgendoEventKind> {
        let entries = read_entries(&self.inbox_path);
        if entries.len() <= self.last_len {
            if entries.len() < self.last_len {
                warn!(
                    path = %self.inbox_path.display(),
                    "team inbox shrank — resetting snapshot without re-firing"
                );
            }
            self.last_len = entries.len();
            return Vec::new();
        }

        let new_entries = &entries[self.last_len..];
        let events = new_entries
            .iter()
            .map(|e| AgendoEventKind::TeamMessage {
                author: e.author.clone(),
                text: e.text.clone(),
                structured_payload: serde_json::from_str(&e.text).ok(),
            })
            .collect();
        self.last_len = entries.len();
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_inbox(dir: &Path, entries: &str) -> PathBuf {
        let path = dir.join("inbox.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(entries.as_bytes()).unwrap();
        path
    }

    #[test]
    fn resolve_finds_team_by_member_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let teams_dir = dir.path().join("teams");
        std::fs::create_dir_all(&teams_dir).unwrap();
        let inbox = dir.path().join("inbox.json");
        std::fs::write(
            teams_dir.join("t1.json"),
            serde_json::json!({"members": ["s1", "s2"], "inbox_path": inbox}).to_string(),
        )
        .unwrap();
        let found = resolve_team_inbox(dir.path(), "s2").unwrap();
        assert_eq!(found, inbox);
    }

    #[test]
    fn resolve_returns_none_when_no_team_claims_session() {
        let dir = tempfile::tempdir().unwrap();
        let found = resolve_team_inbox(dir.path(), "s99");
        assert!(found.is_none());
    }

    #[test]
    fn startup_snapshots_preexisting_messages_without_firing() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = write_inbox(
            dir.path(),
            r#"[{"author":"a","text":"old"}]"#,
        );
        let mut monitor = TeamInboxMonitor::start(inbox);
        assert!(monitor.poll().is_empty());
    }

    #[test]
    fn new_entries_are_detected_by_length_delta() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = write_inbox(dir.path(), r#"[{"author":"a","text":"old"}]"#);
        let mut monitor = TeamInboxMonitor::start(inbox.clone());
        assert!(monitor.poll().is_empty());

        std::fs::write(
            &inbox,
            r#"[{"author":"a","text":"old"},{"author":"b","text":"new one"}]"#,
        )
        .unwrap();
        let events = monitor.poll();
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgendoEventKind::TeamMessage { author, text, .. } => {
                assert_eq!(author, "b");
                assert_eq!(text, "new one");
            }
            _ => panic!("wrong event kind"),
        }
    }

    #[test]
    fn structured_json_text_is_parsed_into_payload() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = write_inbox(dir.path(), "[]");
        let mut monitor = TeamInboxMonitor::start(inbox.clone());
        std::fs::write(&inbox, r#"[{"author":"a","text":"{\"kind\":\"ping\"}"}]"#).unwrap();
        let events = monitor.poll();
        match &events[0] {
            AgendoEventKind::TeamMessage { structured_payload, .. } => {
                assert!(structured_payload.is_some());
            }
            _ => panic!("wrong event kind"),
        }
    }
}
