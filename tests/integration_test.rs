//! Integration tests for the control-plane RPC surface.
//!
//! These drive `ipc::dispatch_text` directly against a real `Storage`
//! backed by a temp SQLite file — no network, no real agent CLI child
//! processes. Handlers that would spawn a live adapter (`session.create`
//! with a valid agent + cwd) are exercised only up to the point where
//! they'd hand off to a real child process; the rest of the surface is
//! covered end to end.

use agendo_host::config::WorkerConfig;
use agendo_host::ipc::dispatch_text;
use agendo_host::AppContext;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

async fn test_ctx() -> (TempDir, Arc<AppContext>) {
    let dir = TempDir::new().unwrap();
    let config = WorkerConfig::new(
        Some(0),
        Some(dir.path().to_path_buf()),
        Some(dir.path().join("nonexistent-config.toml")),
        Some("test-worker".to_string()),
        None,
        None,
        Some(4),
    );
    let ctx = AppContext::new(config, None).await.expect("build AppContext");
    (dir, ctx)
}

async fn rpc(ctx: &Arc<AppContext>, method: &str, params: Value) -> Value {
    rpc_with_token(ctx, method, params, &ctx.auth_token).await
}

async fn rpc_with_token(ctx: &Arc<AppContext>, method: &str, params: Value, token: &str) -> Value {
    let req = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    let resp = dispatch_text(&req.to_string(), ctx, token).await;
    serde_json::from_str(&resp).expect("response is valid JSON")
}

#[tokio::test]
async fn daemon_ping_responds() {
    let (_dir, ctx) = test_ctx().await;
    let resp = rpc(&ctx, "daemon.ping", Value::Null).await;
    assert_eq!(resp["result"]["pong"], true);
}

#[tokio::test]
async fn daemon_status_reports_worker_identity_and_slots() {
    let (_dir, ctx) = test_ctx().await;
    let resp = rpc(&ctx, "daemon.status", Value::Null).await;
    assert_eq!(resp["result"]["workerId"], "test-worker");
    assert_eq!(resp["result"]["activeSessions"], 0);
    assert_eq!(resp["result"]["availableSlots"], 4);
    assert_eq!(resp["result"]["maxConcurrentSessions"], 4);
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let (_dir, ctx) = test_ctx().await;
    let resp = rpc(&ctx, "session.doesNotExist", Value::Null).await;
    assert_eq!(resp["error"]["code"], -32601);
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let (_dir, ctx) = test_ctx().await;
    let resp = rpc_with_token(&ctx, "daemon.ping", Value::Null, "not-the-real-token").await;
    assert_eq!(resp["error"]["code"], -32004);
}

#[tokio::test]
async fn session_create_rejects_unknown_agent() {
    let (_dir, ctx) = test_ctx().await;
    let resp = rpc(
        &ctx,
        "session.create",
        json!({"agentId": "chatgpt-5000", "cwd": "/tmp", "initialPrompt": "hi"}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
}

#[tokio::test]
async fn session_create_rejects_missing_cwd() {
    let (_dir, ctx) = test_ctx().await;
    let resp = rpc(
        &ctx,
        "session.create",
        json!({"agentId": "claude", "cwd": "/path/does/not/exist/anywhere", "initialPrompt": "hi"}),
    )
    .await;
    assert!(resp["error"].is_object(), "expected an error, got {resp:?}");
}

#[tokio::test]
async fn session_create_rejects_when_no_slots_available() {
    let (dir, ctx) = test_ctx().await;
    // Exhaust every slot directly so session.create's admission check fires
    // before it would otherwise try to spawn a real adapter process.
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(ctx.slot_queue.acquire().await);
    }
    let resp = rpc(
        &ctx,
        "session.create",
        json!({"agentId": "claude", "cwd": dir.path().to_str().unwrap(), "initialPrompt": "hi"}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32007);
}

#[tokio::test]
async fn session_lifecycle_list_get_delete() {
    let (_dir, ctx) = test_ctx().await;

    // Seed a session row directly through storage, bypassing the adapter
    // spawn that a full session.create would trigger.
    let row = ctx
        .storage
        .create_session("s1", "claude", "cap-1", None, None, "default", "hello", 3600, Some("My session"))
        .await
        .unwrap();
    assert_eq!(row.status, "idle");

    let listed = rpc(&ctx, "session.list", Value::Null).await;
    assert_eq!(listed["result"].as_array().unwrap().len(), 1);

    let got = rpc(&ctx, "session.get", json!({"sessionId": "s1"})).await;
    assert_eq!(got["result"]["id"], "s1");
    assert_eq!(got["result"]["agentId"], "claude");
    assert_eq!(got["result"]["title"], "My session");

    let deleted = rpc(&ctx, "session.delete", json!({"sessionId": "s1"})).await;
    assert!(deleted["error"].is_null(), "expected success, got {deleted:?}");

    let missing = rpc(&ctx, "session.get", json!({"sessionId": "s1"})).await;
    assert_eq!(missing["error"]["code"], -32001);
}

#[tokio::test]
async fn control_rpcs_on_unsupervised_session_return_session_not_found() {
    let (_dir, ctx) = test_ctx().await;
    ctx.storage
        .create_session("s2", "codex", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();

    for (method, params) in [
        ("session.sendMessage", json!({"sessionId": "s2", "text": "go"})),
        ("session.interrupt", json!({"sessionId": "s2"})),
        ("session.cancel", json!({"sessionId": "s2"})),
        ("session.setPermissionMode", json!({"sessionId": "s2", "mode": "plan"})),
        ("session.setModel", json!({"sessionId": "s2", "model": "gpt-5"})),
        ("session.terminate", json!({"sessionId": "s2"})),
        (
            "approval.respond",
            json!({"sessionId": "s2", "approvalId": "a1", "decision": "allow"}),
        ),
        (
            "approval.answerQuestion",
            json!({"sessionId": "s2", "approvalId": "a1", "questions": ["q"], "answers": ["a"]}),
        ),
    ] {
        let resp = rpc(&ctx, method, params).await;
        assert_eq!(resp["error"]["code"], -32001, "method {method} expected SESSION_NOT_FOUND, got {resp:?}");
    }
}

#[tokio::test]
async fn approval_respond_rejects_unknown_decision() {
    let (_dir, ctx) = test_ctx().await;
    ctx.storage
        .create_session("s3", "claude", "cap-1", None, None, "default", "hello", 3600, None)
        .await
        .unwrap();
    let resp = rpc(
        &ctx,
        "approval.respond",
        json!({"sessionId": "s3", "approvalId": "a1", "decision": "maybe"}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
}
