//! Layered configuration: CLI/env (clap) > TOML file > built-in defaults.
//!
//! Structural fields (`data_dir`, `worker_id`) require a restart; the
//! timeout/log subset is watched and hot-reloaded via [`ConfigWatcher`].

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TEAM_IDLE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_SIGKILL_GRACE_SECS: u64 = 5;
const DEFAULT_MAX_REENQUEUE_ATTEMPTS: u32 = 3;

/// Per-agent binary path / extra-args override, e.g. `[agent.claude]`.
#[derive(Debug, Clone, Deserialize, Default, serde::Serialize)]
pub struct AgentProfile {
    /// Override the binary looked up on PATH (default: the agent id itself).
    pub binary_path: Option<String>,
    /// Extra CLI args appended to every spawn/resume invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ReconcilerToml {
    max_reenqueue_attempts: Option<u32>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    worker_id: Option<String>,
    max_concurrent_sessions: Option<usize>,
    heartbeat_interval_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    team_idle_timeout_secs: Option<u64>,
    sigkill_grace_secs: Option<u64>,
    log: Option<String>,
    log_format: Option<String>,
    reconciler: Option<ReconcilerToml>,
    agent: Option<HashMap<String, AgentProfile>>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

/// Stable machine-derived worker id used when none is configured — the
/// hostname, or a random id if the hostname can't be read.
fn derive_worker_id() -> String {
    hostname_fallback().unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
}

fn hostname_fallback() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub worker_id: String,
    pub log: String,
    pub log_format: String,
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub team_idle_timeout_secs: u64,
    pub sigkill_grace_secs: u64,
    pub max_reenqueue_attempts: u32,
    pub agents: HashMap<String, AgentProfile>,
}

impl WorkerConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest): CLI/env > TOML file > built-in default.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        config_path: Option<PathBuf>,
        worker_id: Option<String>,
        log: Option<String>,
        log_format: Option<String>,
        max_concurrent_sessions: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let config_path = config_path.unwrap_or_else(|| data_dir.join("config.toml"));
        let toml = load_toml(&config_path).unwrap_or_default();

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            worker_id: worker_id.or(toml.worker_id).unwrap_or_else(derive_worker_id),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            log_format: log_format.or(toml.log_format).unwrap_or_else(|| "pretty".to_string()),
            max_concurrent_sessions: max_concurrent_sessions
                .or(toml.max_concurrent_sessions)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_SESSIONS),
            heartbeat_interval_secs: toml
                .heartbeat_interval_secs
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            idle_timeout_secs: toml.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            team_idle_timeout_secs: toml
                .team_idle_timeout_secs
                .unwrap_or(DEFAULT_TEAM_IDLE_TIMEOUT_SECS),
            sigkill_grace_secs: toml.sigkill_grace_secs.unwrap_or(DEFAULT_SIGKILL_GRACE_SECS),
            max_reenqueue_attempts: toml
                .reconciler
                .and_then(|r| r.max_reenqueue_attempts)
                .unwrap_or(DEFAULT_MAX_REENQUEUE_ATTEMPTS),
            agents: toml.agent.unwrap_or_default(),
            data_dir,
            config_path,
        }
    }

    pub fn agent_profile(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting the worker.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub idle_timeout_secs: u64,
    pub sigkill_grace_secs: u64,
}

/// Watches the config file for changes and reloads non-critical fields.
///
/// Only `log_level`, `idle_timeout_secs`, and `sigkill_grace_secs` are
/// reloaded; `data_dir`, `worker_id`, and `port` require a full restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `config_path` for changes.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal; the
    /// worker runs fine without hot-reload).
    pub fn start(config_path: &Path) -> Option<Self> {
        let initial = load_hot_config(config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.to_path_buf();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.idle_timeout_secs != new_config.idle_timeout_secs
                                || guard.sigkill_grace_secs != new_config.sigkill_grace_secs
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    idle_timeout_secs = new_config.idle_timeout_secs,
                                    "config reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self { hot, _watcher: debouncer })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

fn load_hot_config(path: &Path) -> HotConfig {
    let toml = load_toml(path).unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        idle_timeout_secs: toml.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        sigkill_grace_secs: toml.sigkill_grace_secs.unwrap_or(DEFAULT_SIGKILL_GRACE_SECS),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("agendo-host");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("agendo-host");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("agendo-host");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("agendo-host");
        }
    }
    PathBuf::from(".agendo-host")
}
