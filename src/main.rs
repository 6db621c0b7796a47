use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use codeint_agent::agent::Agent;
use codeint_agent::config::Config;
use codeint_agent::tracer::transport;

/// Upper bound on waiting for leftover blocking source reads at exit.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime integration profiler: turns probe records into per-application
/// integration manifests.
#[derive(Parser)]
#[command(name = "codeint-agent", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Record source path ("-" for stdin). Overrides `source.path`.
    #[arg(long)]
    source: Option<String>,

    /// Manifest output directory. Overrides `output.dir` and `OUT_DIR`.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("codeint-agent {}", version::full());
        return Ok(());
    }

    let mut cfg = Config::load_or_default(cli.config.as_deref()).with_context(|| {
        match &cli.config {
            Some(path) => format!("loading config from {}", path.display()),
            None => "building default config".to_string(),
        }
    })?;

    if let Some(source) = cli.source {
        cfg.source.path = source;
    }
    if let Some(dir) = cli.out_dir {
        cfg.output.dir = dir;
    }
    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }
    cfg.validate().context("validating command line overrides")?;

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting codeint-agent",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = rt.block_on(async { run(cfg).await });

    // Reads from stdin, FIFOs and files run on blocking threads that cannot be
    // cancelled; do not wait on them once the final flush is done.
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    result
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    // Bridge the configured record source into the bounded ingestion queue.
    let reader = transport::open_source(&cfg.source.path).await?;
    let (sender, queue) = transport::channel(cfg.source.channel_capacity);
    let pump_cancel = CancellationToken::new();
    let pump = transport::spawn_pump(reader, sender, pump_cancel.clone());

    tracing::info!(
        source = %cfg.source.path,
        capacity = cfg.source.channel_capacity,
        "record source opened"
    );

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start(queue).await?;

    // Run until a signal arrives or the source is exhausted.
    tokio::select! {
        _ = shutdown_rx => {}
        _ = agent.wait_for_ingest_end() => {
            tracing::info!("record source exhausted");
        }
    }

    // Graceful shutdown.
    pump_cancel.cancel();
    let summary = agent.stop().await?;

    match pump.await {
        Ok(forwarded) => tracing::debug!(forwarded, "record pump stopped"),
        Err(e) => tracing::warn!(error = %e, "record pump task failed"),
    }

    tracing::info!(
        received = summary.received,
        merged = summary.merged,
        manifests = summary.final_flush.map(|r| r.written).unwrap_or(0),
        "codeint-agent stopped"
    );

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
