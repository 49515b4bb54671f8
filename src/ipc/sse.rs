//! SSE bridge: streams a session's durable log back to HTTP clients.
//!
//! `GET /sessions/{id}/logs/stream` replays the log file from byte 0 (or
//! from the offset carried in `Last-Event-ID`, for resume after a dropped
//! connection) and then follows new lines as they're appended. The log
//! file is the source of truth — the event bus subscription here is only a
//! wakeup signal for the tail loop, never itself the data.

use crate::session::log::SessionLog;
use crate::AppContext;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SSE_CHANNEL_CAPACITY: usize = 256;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/sessions/{id}/logs/stream", get(stream_logs))
        .with_state(ctx)
}

async fn stream_logs(
    Path(id): Path<String>,
    headers: HeaderMap,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    let session = match ctx.storage.get_session(&id).await {
        Ok(Some(row)) => row,
        Ok(None) => return (StatusCode::NOT_FOUND, "session not found").into_response(),
        Err(e) => {
            warn!(session_id = %id, err = %e, "failed to look up session for sse stream");
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
        }
    };

    let start_offset = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let log_path = SessionLog::path_for(&ctx.config.data_dir, &id);
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(SSE_CHANNEL_CAPACITY);

    let status_payload = serde_json::json!({ "sessionId": id, "status": session.status }).to_string();
    let _ = tx.send(Event::default().event("status").id(start_offset.to_string()).data(status_payload)).await;

    let mut bus_rx = ctx.event_bus.subscribe(&id).await;
    let session_id = id.clone();
    let storage = ctx.storage.clone();

    tokio::spawn(async move {
        let mut offset = start_offset;
        let mut first_pass = true;

        loop {
            let event_name = if first_pass { "catchup" } else { "log" };
            match tail_once(&log_path, &mut offset, event_name, &tx).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(session_id = %session_id, err = %e, "sse log tail failed");
                    let _ = tx.send(Event::default().event("error").data(e.to_string())).await;
                    break;
                }
            }
            first_pass = false;

            if tx.is_closed() {
                break;
            }

            let ended = storage
                .get_session(&session_id)
                .await
                .ok()
                .flatten()
                .map(|s| s.status == "ended")
                .unwrap_or(true);

            if ended && fully_drained(&log_path, offset).await {
                let _ = tx.send(Event::default().event("done").data("{}")).await;
                break;
            }

            tokio::select! {
                _ = bus_rx.recv() => {}
                _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
            }
        }
    });

    let stream: ReceiverStream<Event> = ReceiverStream::new(rx);
    let stream = stream.map(Ok::<Event, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Read whatever has been appended to the log since `offset`, advancing it
/// past each complete line. A trailing partial line (the writer mid-flush)
/// is left for the next pass. `offset` after return doubles as the SSE
/// event id, so a reconnect's `Last-Event-ID` resumes exactly where the
/// client left off.
async fn tail_once(
    path: &FsPath,
    offset: &mut u64,
    event_name: &'static str,
    tx: &tokio::sync::mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len <= *offset {
        return Ok(());
    }
    file.seek(std::io::SeekFrom::Start(*offset)).await?;
    let mut reader = BufReader::new(file);

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || !line.ends_with('\n') {
            break;
        }
        *offset += n as u64;
        let trimmed = line.trim_end_matches('\n');
        if tx.send(Event::default().event(event_name).id(offset.to_string()).data(trimmed)).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn fully_drained(path: &FsPath, offset: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() <= offset,
        Err(_) => true,
    }
}
