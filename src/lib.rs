//! Agendo session worker: supervises long-lived AI agent CLI child
//! processes (Claude, Codex, Gemini) on behalf of the Agendo web app.

pub mod config;
pub mod error;
pub mod ipc;
pub mod mailbox;
pub mod observability;
pub mod policy;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod zombie;

use config::{ConfigWatcher, HotConfig, WorkerConfig};
use ipc::event::{ControlBus, EventBus};
use policy::risk::RiskDatabase;
use scheduler::SlotQueue;
use session::supervisor::SessionSupervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use storage::Storage;
use tokio::sync::RwLock;

/// Shared application state handed to every RPC handler and background task.
pub struct AppContext {
    pub config: Arc<WorkerConfig>,
    pub storage: Arc<Storage>,
    pub event_bus: Arc<EventBus>,
    pub control_bus: Arc<ControlBus>,
    pub slot_queue: Arc<SlotQueue>,
    pub risk_db: Arc<RiskDatabase>,
    pub supervisors: RwLock<HashMap<String, Arc<SessionSupervisor>>>,
    pub auth_token: String,
    pub started_at: Instant,
    pub hot_config: Option<Arc<RwLock<HotConfig>>>,
}

impl AppContext {
    pub async fn new(config: WorkerConfig, watcher: Option<&ConfigWatcher>) -> anyhow::Result<Arc<Self>> {
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let risk_path = config.data_dir.join("risk_overrides.json");
        let risk_db = Arc::new(RiskDatabase::load_from_json(&risk_path));
        let auth_token = ipc::auth::get_or_create_token(&config.data_dir)?;

        Ok(Arc::new(Self {
            slot_queue: SlotQueue::new(config.max_concurrent_sessions),
            event_bus: EventBus::new(),
            control_bus: ControlBus::new(),
            risk_db,
            storage,
            auth_token,
            config: Arc::new(config),
            supervisors: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
            hot_config: watcher.map(|w| w.hot.clone()),
        }))
    }

    /// Register a running supervisor so RPC handlers can look it up by
    /// session id. Spawns a cleanup task that removes the entry once the
    /// supervisor's run has fully exited.
    pub async fn register_supervisor(&self, supervisor: Arc<SessionSupervisor>, ctx: Arc<AppContext>) {
        let session_id = supervisor.session_id().to_string();
        self.supervisors.write().await.insert(session_id.clone(), supervisor.clone());
        tokio::spawn(async move {
            supervisor.wait_for_exit().await;
            ctx.supervisors.write().await.remove(&session_id);
        });
    }

    pub async fn get_supervisor(&self, session_id: &str) -> Option<Arc<SessionSupervisor>> {
        self.supervisors.read().await.get(session_id).cloned()
    }

    pub async fn active_supervisor_count(&self) -> usize {
        self.supervisors.read().await.len()
    }
}
