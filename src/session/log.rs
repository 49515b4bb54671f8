//! Append-only, rotated session log writer.
//!
//! Path: `{data_dir}/sessions/{yyyy}/{mm}/{sessionId}.log`. Each line is
//! `[<stream>] <body>\n` where `stream` is `stdout|stderr|system|user`.
//! Canonical events are serialized as `[<id>|<type>] <json>` inside the
//! `system` stream. This file is the durable source of truth for replay;
//! the event bus is a transport only.

use crate::session::types::AgendoEvent;
use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    System,
    User,
}

impl Stream {
    fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
            Self::User => "user",
        }
    }
}

pub struct SessionLog {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl SessionLog {
    /// Compute the rotated path for a session without opening it.
    pub fn path_for(data_dir: &Path, session_id: &str) -> PathBuf {
        let now = Utc::now();
        data_dir
            .join("sessions")
            .join(format!("{:04}", now.format("%Y")))
            .join(format!("{:02}", now.format("%m")))
            .join(format!("{session_id}.log"))
    }

    pub fn new(data_dir: &Path, session_id: &str) -> Self {
        Self {
            path: Self::path_for(data_dir, session_id),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_open(&self, guard: &mut Option<tokio::fs::File>) -> Result<()> {
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(f);
        }
        Ok(())
    }

    /// Write a raw line (child stdout/stderr, or a user-facing system line)
    /// tagged with its stream. Does not stamp sequence numbers.
    pub async fn write_raw(&self, stream: Stream, body: &str) -> Result<()> {
        let mut guard = self.file.lock().await;
        self.ensure_open(&mut guard).await?;
        let file = guard.as_mut().unwrap();
        let line = format!("[{}] {}\n", stream.tag(), body);
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Write a canonical event under the `system` stream, using its
    /// `[<id>|<type>] <json>` body format. Deltas are never logged.
    pub async fn write_event(&self, event: &AgendoEvent) -> Result<()> {
        if event.kind.is_delta() {
            return Ok(());
        }
        self.write_raw(Stream::System, &event.log_body()).await
    }

    pub async fn close(&self) {
        let mut guard = self.file.lock().await;
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::AgendoEventKind;

    #[tokio::test]
    async fn rotated_path_contains_year_and_month() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path(), "sess-1");
        let path = log.path().to_string_lossy().to_string();
        assert!(path.contains("sessions"));
        assert!(path.ends_with("sess-1.log"));
    }

    #[tokio::test]
    async fn write_raw_and_event_append_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path(), "sess-1");
        log.write_raw(Stream::Stdout, "hello").await.unwrap();
        let event = AgendoEvent {
            id: 1,
            session_id: "sess-1".into(),
            ts: 0,
            kind: AgendoEventKind::AgentText { text: "hi".into() },
        };
        log.write_event(&event).await.unwrap();
        log.close().await;

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "[stdout] hello");
        assert!(lines[1].starts_with("[system] [1|agent:text] "));
    }

    #[tokio::test]
    async fn deltas_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path(), "sess-1");
        let event = AgendoEvent {
            id: 1,
            session_id: "sess-1".into(),
            ts: 0,
            kind: AgendoEventKind::AgentTextDelta { delta: "h".into() },
        };
        log.write_event(&event).await.unwrap();
        log.close().await;
        assert!(!log.path().exists());
    }
}
