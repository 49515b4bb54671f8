use anyhow::Result;
use agendo_host::config::{ConfigWatcher, WorkerConfig};
use agendo_host::{ipc, zombie, AppContext};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "agendo-host", about = "Agendo session worker", version)]
struct Args {
    /// Control-plane server port
    #[arg(long, env = "AGENDO_PORT")]
    port: Option<u16>,

    /// Data directory for session logs, config, and the SQLite database
    #[arg(long, env = "AGENDO_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Config file path (default: `{data_dir}/config.toml`)
    #[arg(long, env = "AGENDO_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Stable id for this worker (default: derived from hostname)
    #[arg(long, env = "AGENDO_WORKER_ID")]
    worker_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AGENDO_LOG")]
    log: Option<String>,

    /// Log encoding: pretty (local dev) or json (production aggregation)
    #[arg(long, env = "AGENDO_LOG_FORMAT")]
    log_format: Option<String>,

    /// Maximum concurrent sessions (the slot count)
    #[arg(long, env = "AGENDO_MAX_SESSIONS")]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = WorkerConfig::new(
        args.port,
        args.data_dir,
        args.config,
        args.worker_id,
        args.log,
        args.log_format,
        args.max_sessions,
    );

    let _guard = setup_logging(&config.log, &config.log_format, &config.data_dir);

    info!(version = env!("CARGO_PKG_VERSION"), "agendo-host starting");
    info!(
        worker_id = %config.worker_id,
        data_dir = %config.data_dir.display(),
        port = config.port,
        max_concurrent_sessions = config.max_concurrent_sessions,
        "config loaded"
    );

    for agent in ["claude", "codex", "gemini"] {
        let binary = config.agent_profile(agent).and_then(|p| p.binary_path.clone()).unwrap_or_else(|| agent.to_string());
        let available = std::process::Command::new(&binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        if available {
            info!(agent, binary = %binary, "agent CLI found");
        } else {
            warn!(agent, binary = %binary, "agent CLI not found on PATH — sessions using this agent will fail to spawn");
        }
    }

    let watcher = ConfigWatcher::start(&config.config_path);
    if watcher.is_none() {
        warn!(path = %config.config_path.display(), "config hot-reload watcher not started");
    }

    let ctx = AppContext::new(config, watcher.as_ref()).await?;

    let report = zombie::reconcile(&ctx.storage, &ctx.config).await?;
    if report.sessions_released > 0 || report.sessions_ended > 0 || report.executions_orphaned > 0 {
        info!(
            released = report.sessions_released,
            ended = report.sessions_ended,
            orphaned_executions = report.executions_orphaned,
            "boot-time zombie reconciliation complete"
        );
    }

    // Keep the watcher alive for the process lifetime; dropping it stops
    // the debounced filesystem watch.
    let _watcher = watcher;

    ipc::run(ctx).await
}

/// Initialize the tracing subscriber: stdout plus a daily-rolling file under
/// `{data_dir}/logs`. If the log directory can't be created, falls back to
/// stdout-only and emits a warning — logging setup must never panic the
/// process. Returns a `WorkerGuard` that must stay alive for the process
/// lifetime (dropping it stops the non-blocking file writer).
fn setup_logging(
    log_level: &str,
    log_format: &str,
    data_dir: &std::path::Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let json = log_format == "json";

    let log_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", log_dir.display());
        let result = if json {
            tracing_subscriber::registry().with(env_filter()).with(tracing_subscriber::fmt::layer().json()).try_init()
        } else {
            tracing_subscriber::registry().with(env_filter()).with(tracing_subscriber::fmt::layer().compact()).try_init()
        };
        if let Err(e) = result {
            eprintln!("warn: failed to initialize tracing subscriber: {e}");
        }
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, "agendo-host.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().json())
            .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("warn: failed to initialize tracing subscriber: {e} — continuing without structured logs");
        return None;
    }
    Some(guard)
}
