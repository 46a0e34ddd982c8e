#![forbid(unsafe_code)]

//! `agent-shell`: persistent shell server binary.
//!
//! Loads configuration, builds the shell manager and protocol server, and
//! serves JSON-RPC over stdin/stdout until the client goes away or a
//! termination signal arrives. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_shell::rpc::transport;
use agent_shell::server::{ProtocolServer, ResourceRegistry};
use agent_shell::shell::ShellManager;
use agent_shell::tools::ToolRegistry;
use agent_shell::{AppError, Config, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "agent-shell",
    about = "Persistent shell over stdio JSON-RPC",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Initial working directory of the shell.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "agent-shell bootstrap");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let code = runtime.block_on(run(args))?;

    // A blocking stdin read may still be parked in the pool.
    runtime.shutdown_background();
    std::process::exit(code);
}

async fn run(args: Cli) -> Result<i32> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::default(),
    };

    if let Some(ws) = &args.workspace {
        config
            .set_working_dir(ws)
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
    }
    info!(program = config.shell.program, "configuration loaded");

    // ── Build shared state ──────────────────────────────
    let shell = Arc::new(ShellManager::new(config.shell.clone()));
    let server = Arc::new(ProtocolServer::new(
        &config.server,
        ToolRegistry::builtin(&shell),
        ResourceRegistry::builtin(&shell),
    ));

    // ── Serve stdio until exit ──────────────────────────
    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let reason = transport::serve(
        Arc::clone(&server),
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.server.liveness_interval(),
        ct,
    )
    .await;

    signal_handle.abort();

    // ── Tear down the shell ─────────────────────────────
    shell.shutdown().await;
    info!(?reason, code = reason.exit_code(), "agent-shell shut down");

    Ok(reason.exit_code())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
