//! Daemon Server Implementation
//!
//! Accept loop over an acquired control socket:
//! - Accepts management connections on the listening handle
//! - Validates peer credentials (same UID or root)
//! - Spawns a handler task per connection
//! - Answers a line-oriented exchange (`ping`, `status`)
//! - Removes the socket file on graceful shutdown
//!
//! The acquisition protocol itself lives in `ctlsock-core`; this
//! server is the collaborator that consumes the listening handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn, Instrument};

use ctlsock_core::ControlListener;

/// Configuration for the daemon server
pub struct ServerConfig {
    /// Maximum number of concurrent management connections
    pub max_connections: usize,
    /// Accept timeout used to poll the shutdown flag, in milliseconds
    pub accept_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            accept_poll_ms: 100,
        }
    }
}

/// State tracked per management connection
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
}

/// Reply to the `status` command
#[derive(Debug, Serialize)]
struct StatusReply {
    /// Daemon process ID
    pid: u32,
    /// Seconds since the server started
    uptime_secs: u64,
    /// Currently connected management clients
    connections: usize,
}

/// The main daemon server
pub struct DaemonServer {
    /// The bound listener, converted for async accept
    listener: UnixListener,
    /// Path of the socket file, for shutdown cleanup
    socket_path: PathBuf,
    /// Server configuration
    config: ServerConfig,
    /// Active connections
    connections: Arc<DashMap<u64, ConnectionState>>,
    /// Monotonic connection ID source
    next_conn_id: AtomicU64,
    /// When the server started
    started_at: Instant,
}

impl DaemonServer {
    /// Wrap an acquired control socket for serving.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(listener: ControlListener, config: ServerConfig) -> Result<Self> {
        let socket_path = listener.path().to_path_buf();
        let listener = listener
            .into_tokio()
            .context("failed to register control socket with the runtime")?;

        Ok(Self {
            listener,
            socket_path,
            config,
            connections: Arc::new(DashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started_at: Instant::now(),
        })
    }

    /// Get peer credentials from a connected stream
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Peer credentials are unavailable off Linux; filesystem
    /// permissions on the socket are the only gate there.
    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(_stream: &UnixStream) -> Option<u32> {
        None
    }

    /// Run the accept loop until `shutdown` is set.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(path = ?self.socket_path, "listening for management connections");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout so the shutdown flag is polled.
            let accept_result = tokio::time::timeout(
                tokio::time::Duration::from_millis(self.config.accept_poll_ms),
                self.listener.accept(),
            )
            .await;

            let (stream, _addr) = match accept_result {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connections.len() >= self.config.max_connections {
                warn!("connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            let our_uid = unsafe { libc::getuid() };
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            self.connections.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                },
            );

            info!(
                conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connections.len(),
                "management client connected"
            );

            let connections = Arc::clone(&self.connections);
            let started_at = self.started_at;
            tokio::spawn(
                Self::handle_connection(conn_id, stream, started_at, connections)
                    .instrument(tracing::info_span!("connection", conn_id)),
            );
        }

        self.shutdown().await
    }

    /// Handle a single management connection.
    ///
    /// Line-oriented: one command in, one reply out.
    async fn handle_connection(
        conn_id: u64,
        stream: UnixStream,
        started_at: Instant,
        connections: Arc<DashMap<u64, ConnectionState>>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("client disconnected (EOF)");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "read error");
                    break;
                }
            };

            let mut reply = match line.trim() {
                "" => continue,
                "ping" => "pong".to_string(),
                "status" => {
                    let status = StatusReply {
                        pid: std::process::id(),
                        uptime_secs: started_at.elapsed().as_secs(),
                        connections: connections.len(),
                    };
                    match serde_json::to_string(&status) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to encode status");
                            "error: internal".to_string()
                        }
                    }
                }
                other => format!("error: unknown command '{other}'"),
            };

            reply.push('\n');
            if let Err(e) = write_half.write_all(reply.as_bytes()).await {
                warn!(error = %e, "write error");
                break;
            }
        }

        if let Some((_, state)) = connections.remove(&conn_id) {
            info!(
                peer_uid = ?state.peer_uid,
                uptime_secs = state.connected_at.elapsed().as_secs(),
                active_connections = connections.len(),
                "management client disconnected"
            );
        }
    }

    /// Graceful shutdown: unlink the socket file so the next start
    /// binds cleanly instead of going through stale recovery.
    async fn shutdown(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "socket file removed");
        }

        info!("shutdown complete");
        Ok(())
    }

    /// Number of active management connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
