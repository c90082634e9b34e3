//! Bridge Daemon - WebSocket Gateway to Supervised Worker Processes
//!
//! Entry point for the bridge daemon. Each client connecting on
//! `/recognition` or `/chat` gets its own worker process for as long as the
//! connection lasts.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:3001)
//! bridge-daemon
//!
//! # Custom listen address and store
//! bridge-daemon --bind 0.0.0.0:3001 --store-path /var/lib/bridge/faces.db
//!
//! # With config file
//! bridge-daemon --config /etc/worker-bridge/bridge.toml
//!
//! # Daemonize (run in background)
//! bridge-daemon --daemonize
//!
//! # Verbose logging, including worker stderr
//! RUST_LOG=debug bridge-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown, every worker is terminated
//! - `SIGHUP`: Reload configuration for connections accepted afterwards

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_core::{default_config_path, load_config_from_path, ConfigOverrides};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use server::DaemonServer;

/// Bridge Daemon - connects WebSocket clients to per-connection worker processes
#[derive(Parser, Debug)]
#[command(name = "bridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (overrides config file and environment)
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Shared store passed to every worker (overrides config file and environment)
    #[arg(long, value_name = "PATH")]
    store_path: Option<PathBuf>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path
    #[arg(long, env = "BRIDGE_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref bind) = self.bind {
            overrides = overrides.with_bind_address(bind.clone());
        }
        if let Some(ref path) = self.store_path {
            overrides = overrides.with_store_path(path.clone());
        }
        overrides
    }
}

/// Get the default PID file path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/worker-bridge-$UID/
fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("worker-bridge")
            .join("bridge.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/worker-bridge-{uid}/bridge.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Check if another daemon is running by checking PID file
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in file: {pid_path:?}"))?;

    // Signal 0 only checks existence
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another bridge-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "bridge_daemon={level},bridge_core={level},worker_diagnostics={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Daemonize the process (fork to background)
///
/// Must run before the Tokio runtime starts.
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // First fork
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    // Create new session
    setsid().context("setsid failed")?;

    // Second fork (prevent acquiring controlling terminal)
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

/// Forward termination and reload signals into flags polled by the server
fn install_signal_handlers(shutdown: Arc<AtomicBool>, reload: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, marking config for reload");
                    reload.store(true, Ordering::SeqCst);
                }
            }
        }
    });

    Ok(())
}

async fn run(args: Args, pid_path: PathBuf) -> Result<()> {
    let config_path = args.config.clone().or_else(default_config_path);
    let overrides = args.overrides();

    let mut config =
        load_config_from_path(config_path.clone()).context("Failed to load configuration")?;
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        bind_address = %config.bind_address,
        store_path = ?config.store_path,
        source = %config.source(),
        "Configuration loaded"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload_config = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutdown), Arc::clone(&reload_config))?;

    write_pid_file(&pid_path)?;

    let mut server = DaemonServer::new(config, config_path, overrides);
    let result = server.run(shutdown, reload_config).await;

    info!("Shutting down...");
    remove_pid_file(&pid_path);
    result
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Bridge Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_daemon(&pid_path)?;

    if args.daemonize {
        info!("Daemonizing...");
        daemonize()?;
        info!("Daemonized, new PID: {}", std::process::id());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match runtime.block_on(run(args, pid_path)) {
        Ok(()) => {
            info!("Bridge daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
