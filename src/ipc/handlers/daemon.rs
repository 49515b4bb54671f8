use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn ping(_params: Value, _ctx: &Arc<AppContext>) -> Result<Value> {
    Ok(json!({ "pong": true }))
}

pub async fn status(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let active_sessions = ctx.active_supervisor_count().await;
    let total_sessions = ctx.storage.count_sessions().await?;
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workerId": ctx.config.worker_id,
        "uptimeSecs": uptime,
        "activeSessions": active_sessions,
        "totalSessions": total_sessions,
        "port": ctx.config.port,
        "maxConcurrentSessions": ctx.config.max_concurrent_sessions,
        "availableSlots": ctx.slot_queue.available(),
    }))
}
