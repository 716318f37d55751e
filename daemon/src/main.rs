//! ctlsockd - Minimal Management Daemon
//!
//! Acquires an exclusively-held control socket via `ctlsock-core` and
//! serves a line-oriented management interface on it. A second
//! instance started for the same name exits with an in-use error
//! instead of disturbing the running one; a socket file left behind by
//! a crash is recovered automatically at startup.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (binds /var/run/ctlsock/ctl0.sock)
//! ctlsockd
//!
//! # Custom socket name and runtime directory
//! ctlsockd --name wg0 --runtime-dir /run/ctlsock
//!
//! # With a PID file
//! ctlsockd --pid-file /run/ctlsockd.pid
//!
//! # Verbose logging
//! RUST_LOG=debug ctlsockd
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown (socket file removed)
//! - `SIGHUP`: logged; there is no configuration to reload yet

mod server;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use server::{DaemonServer, ServerConfig};

/// ctlsockd - minimal management daemon over a control socket
#[derive(Parser, Debug)]
#[command(name = "ctlsockd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Logical control socket name (binds <runtime-dir>/<name>.sock)
    #[arg(short = 'n', long, env = "CTLSOCK_NAME", default_value = "ctl0")]
    name: String,

    /// Override the hosting directory for the control socket
    #[arg(long, env = "CTLSOCK_DIR", value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// PID file path
    #[arg(long, env = "CTLSOCK_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CTLSOCK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Maximum simultaneous management connections
    #[arg(long, default_value_t = 16)]
    max_connections: usize,
}

/// Record our PID at `path`.
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create PID file parent {parent:?}"))?;
    }

    let pid = std::process::id();
    fs::write(path, format!("{pid}\n")).with_context(|| format!("cannot write PID file {path:?}"))?;

    info!(pid = pid, path = ?path, "PID file written");
    Ok(())
}

/// Best-effort PID file removal.
fn remove_pid_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = ?path, "PID file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = ?path, "leaving PID file behind"),
    }
}

/// Refuse to start while the PID recorded at `path` belongs to a live
/// process; a dead PID is treated as leftover and cleared.
fn check_existing_daemon(path: &Path) -> Result<()> {
    let pid_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("cannot read PID file {path:?}")),
    };

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| format!("PID file {path:?} holds no PID"))?;

    // Signal 0 probes for existence without touching the process.
    if unsafe { libc::kill(pid, 0) } == 0 {
        bail!("another ctlsockd appears to be running (PID {pid} recorded in {path:?})");
    }

    warn!(pid = pid, path = ?path, "clearing PID file of dead process");
    remove_pid_file(path);
    Ok(())
}

/// Acquire the control socket, then run the server to completion.
///
/// Ordering matters here: acquisition comes first, so the expected
/// competing-instance failure exits before any PID file exists, and
/// every failure after the PID write funnels through its removal.
async fn run_daemon(args: &Args, shutdown: Arc<AtomicBool>) -> Result<()> {
    // Acquisition is synchronous and happens before the accept loop
    // exists; a second running instance surfaces here as an in-use
    // error and we exit without touching its socket.
    let listener = match args.runtime_dir {
        Some(ref dir) => ctlsock_core::acquire_in(dir, &args.name),
        None => ctlsock_core::acquire(&args.name),
    }
    .with_context(|| format!("failed to acquire control socket '{}'", args.name))?;

    info!(path = ?listener.path(), "control socket acquired");

    if let Some(ref pid_path) = args.pid_file {
        check_existing_daemon(pid_path)?;
        write_pid_file(pid_path)?;
    }

    let config = ServerConfig {
        max_connections: args.max_connections,
        ..ServerConfig::default()
    };
    let run_result = match DaemonServer::new(listener, config) {
        Ok(mut server) => server.run(shutdown).await,
        Err(err) => Err(err),
    };

    if let Some(ref pid_path) = args.pid_file {
        remove_pid_file(pid_path);
    }

    run_result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_for_signals = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    shutdown_for_signals.store(true, Ordering::SeqCst);
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    shutdown_for_signals.store(true, Ordering::SeqCst);
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received; nothing to reload");
                }
            }
        }
    });

    run_daemon(&args, shutdown).await
}

/// Acquisition transiently narrows the process-wide umask; tests that
/// acquire a socket serialize on this lock.
#[cfg(test)]
pub(crate) static UMASK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
