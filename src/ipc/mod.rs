//! Control-plane HTTP/WS server: JSON-RPC 2.0 over a WebSocket for
//! session/approval commands, plain `/health`, and (via [`sse`]) an SSE
//! bridge for per-session event streaming.
//!
//! The WS connection's first message must be `daemon.auth`; every
//! subsequent RPC is re-validated against the same bearer token so token
//! rotation invalidates in-flight connections immediately.

pub mod auth;
pub mod event;
pub mod handlers;
pub mod sse;

use crate::observability::{HealthStatus, LatencyTracker};
use crate::AppContext;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

// ─── RPC error codes ────────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const UNAUTHORIZED: i32 = -32004;
const SESSION_NOT_FOUND: i32 = -32001;
const SESSION_BUSY: i32 = -32002;
const RATE_LIMITED: i32 = -32003;
const SESSION_LIMIT_CODE: i32 = -32007;

// ─── Rate limiting ──────────────────────────────────────────────────────────

const MAX_CONNECTIONS_PER_MIN: usize = 10;
const MAX_RPC_PER_SEC: u32 = 100;

struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now() }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

/// Constant-time token comparison to prevent timing-based token oracle attacks.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

// ─── Server entry point ─────────────────────────────────────────────────────

#[derive(Clone)]
struct ServerState {
    ctx: Arc<AppContext>,
    conn_limiter: Arc<Mutex<ConnectionRateLimiter>>,
}

pub async fn run(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let state = ServerState { ctx: ctx.clone(), conn_limiter: Arc::new(Mutex::new(ConnectionRateLimiter::new())) };

    let core = Router::new()
        .route("/health", get(handle_health))
        .route("/ws", get(handle_ws_upgrade))
        .with_state(state);

    let app = core.merge(sse::router(ctx.clone()));

    let addr = SocketAddr::from(([127, 0, 0, 1], ctx.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = ctx.config.port, "control-plane server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn handle_health(State(state): State<ServerState>) -> impl IntoResponse {
    let ctx = &state.ctx;
    let uptime = ctx.started_at.elapsed().as_secs();
    let active = ctx.active_supervisor_count().await;
    let db_ok = sqlx::query("SELECT 1").execute(&ctx.storage.pool()).await.is_ok();
    let health = HealthStatus::ok(uptime, db_ok);
    Json(serde_json::json!({
        "status": health.status,
        "version": health.version,
        "uptimeSecs": health.uptime_secs,
        "dbOk": health.db_ok,
        "activeSessions": active,
        "port": ctx.config.port,
    }))
}

async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    {
        let mut limiter = state.conn_limiter.lock().await;
        if !limiter.check_and_record(addr.ip()) {
            return (StatusCode::TOO_MANY_REQUESTS, "connection rate limit exceeded — max 10/min").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state.ctx))
}

async fn handle_connection(mut socket: WebSocket, ctx: Arc<AppContext>) {
    // Auth challenge: the first message must be `daemon.auth` with the
    // correct bearer token, or the connection is dropped.
    let client_token = match authenticate(&mut socket, &ctx).await {
        Some(token) => token,
        None => return,
    };
    debug!("client authenticated");

    let mut rpc_limiter = RpcRateLimiter::new();

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                if !rpc_limiter.check() {
                    let resp = error_response(Value::Null, RATE_LIMITED, "RPC rate limit exceeded — max 100 req/sec");
                    if socket.send(Message::Text(resp.into())).await.is_err() {
                        break;
                    }
                    continue;
                }
                let response = dispatch_text(&text, &ctx, &client_token).await;
                if socket.send(Message::Text(response.into())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(err = %e, "ws error");
                break;
            }
        }
    }
}

/// Reads the mandatory `daemon.auth` first frame. Returns the presented
/// token on success (used for per-RPC re-validation), `None` if the
/// connection should be dropped.
async fn authenticate(socket: &mut WebSocket, ctx: &AppContext) -> Option<String> {
    let first = tokio::time::timeout(Duration::from_secs(10), socket.recv()).await;
    let msg = match first {
        Ok(Some(Ok(Message::Text(t)))) => t,
        _ => return None,
    };

    let req: RpcRequest = match serde_json::from_str(&msg) {
        Ok(r) => r,
        Err(_) => {
            let _ = socket.send(Message::Text(error_response(Value::Null, PARSE_ERROR, "Parse error").into())).await;
            return None;
        }
    };
    let id = req.id.clone().unwrap_or(Value::Null);

    if req.method != "daemon.auth" {
        let _ = socket
            .send(Message::Text(error_response(id, UNAUTHORIZED, "Unauthorized — send daemon.auth first").into()))
            .await;
        return None;
    }

    let provided = req.params.as_ref().and_then(|p| p.get("token")).and_then(Value::as_str).unwrap_or_default();

    if !tokens_equal(provided, &ctx.auth_token) {
        let _ = socket
            .send(Message::Text(error_response(id, UNAUTHORIZED, "Unauthorized — invalid token").into()))
            .await;
        return None;
    }

    let resp = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": { "authenticated": true } });
    let _ = socket.send(Message::Text(resp.to_string().into())).await;
    Some(provided.to_string())
}

/// Dispatch a raw JSON-RPC text frame. `client_token` is re-verified against
/// `ctx.auth_token` on every call so token rotation invalidates in-flight
/// connections without needing to close them.
pub async fn dispatch_text(text: &str, ctx: &Arc<AppContext>, client_token: &str) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "Parse error"),
    };

    if !ctx.auth_token.is_empty() && !tokens_equal(client_token, &ctx.auth_token) {
        return error_response(req.id.unwrap_or(Value::Null), UNAUTHORIZED, "Unauthorized — invalid or missing token");
    }

    if req.jsonrpc != "2.0" {
        return error_response(req.id.unwrap_or(Value::Null), INVALID_REQUEST, "Invalid Request");
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    trace!(method = %req.method, "rpc dispatch");
    let tracker = LatencyTracker::start(req.method.clone());
    let result = dispatch(&req.method, params, ctx).await;
    tracker.finish();

    match result {
        Ok(value) => {
            let resp = RpcResponse { jsonrpc: "2.0", id, result: Some(value), error: None };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(e) => {
            let (code, msg) = classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}

async fn dispatch(method: &str, params: Value, ctx: &Arc<AppContext>) -> anyhow::Result<Value> {
    match method {
        "daemon.ping" => handlers::daemon::ping(params, ctx).await,
        "daemon.status" => handlers::daemon::status(params, ctx).await,
        "session.create" => handlers::session::create(params, ctx).await,
        "session.list" => handlers::session::list(params, ctx).await,
        "session.get" => handlers::session::get(params, ctx).await,
        "session.delete" => handlers::session::delete(params, ctx).await,
        "session.terminate" => handlers::session::terminate(params, ctx).await,
        "session.sendMessage" => handlers::session::send_message(params, ctx).await,
        "session.interrupt" => handlers::session::interrupt(params, ctx).await,
        "session.cancel" => handlers::session::cancel(params, ctx).await,
        "session.setPermissionMode" => handlers::session::set_permission_mode(params, ctx).await,
        "session.setModel" => handlers::session::set_model(params, ctx).await,
        "approval.respond" => handlers::approval::respond(params, ctx).await,
        "approval.answerQuestion" => handlers::approval::answer_question(params, ctx).await,
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

fn classify_error(e: &anyhow::Error) -> (i32, String) {
    let msg = e.to_string();

    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.contains("SESSION_NOT_FOUND") {
        return (SESSION_NOT_FOUND, "Session not found".to_string());
    }
    if msg.contains("SESSION_LIMIT_REACHED") {
        return (SESSION_LIMIT_CODE, msg);
    }
    if msg.contains("SESSION_BUSY") {
        return (SESSION_BUSY, msg);
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {}", msg));
    }

    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string())
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: message.to_string() }) };
    serde_json::to_string(&resp).unwrap_or_default()
}
