//! Team inbox monitor: polls a per-team JSON file for appended messages and
//! emits `team:message` events into the owning session's event stream.

pub mod monitor;

pub use monitor::{resolve_team_inbox, TeamInboxMonitor};
