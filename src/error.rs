//! Typed error taxonomy for session-worker internals.
//!
//! Library code returns [`WorkerError`]; call sites and `main` glue use
//! `anyhow::Result` with `.context(...)` for human-readable chains. See
//! the error-handling design notes for the rationale behind each variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Compare-and-set claim affected zero rows — another worker (or a
    /// retried delivery of the same job) already holds the session.
    /// Recovered locally; never surfaced to the user.
    #[error("session claim race: {0}")]
    ClaimRace(String),

    /// The adapter's child process failed to start.
    #[error("adapter failed to spawn: {0}")]
    AdapterSpawnFailure(String),

    /// Malformed wire data from the child (bad JSON-RPC frame, unexpected
    /// shape). Non-fatal to the session; logged as `system:info`.
    #[error("adapter protocol error: {0}")]
    AdapterProtocolError(String),

    /// Per-turn agent failure (rate limit, context length, budget).
    #[error("turn error: {0}")]
    TurnError(String),

    /// Raised internally while draining pending approvals; never
    /// propagated past the supervisor that handles it.
    #[error("approval drain: {0}")]
    ApprovalDrain(String),

    /// Child process crashed or became unresponsive (liveness probe failed).
    #[error("child crashed: {0}")]
    ChildCrash(String),

    /// A control-channel message could not be parsed or routed.
    #[error("malformed control message: {0}")]
    ControlMalformed(String),

    /// Failed to publish an event to the bus. The on-disk log remains the
    /// source of truth for replay, so this is logged and swallowed.
    #[error("publish failure: {0}")]
    PublishFailure(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
