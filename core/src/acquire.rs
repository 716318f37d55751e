//! Control Socket Acquisition
//!
//! One-shot, synchronous acquisition of an exclusively-held listening
//! socket. The procedure is sequential and blocking: it is meant to be
//! called once per logical name during startup, before the caller's
//! event loop exists.
//!
//! Mutual exclusion between processes comes from the operating
//! system's atomic bind-or-fail on the socket path; the only logic
//! added here is distinguishing a genuinely busy path from one
//! abandoned by a crashed previous instance. Recovery is bounded to a
//! single unlink-and-rebind hop, so adversarial recreation of the path
//! surfaces as an error instead of spinning.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::stat::{self, Mode};
use tracing::{debug, warn};

use crate::errors::AcquireError;
use crate::paths::{socket_directory, socket_path_in};

/// Mode for the shared hosting directory: owner full access,
/// group/other traversal.
const DIRECTORY_MODE: u32 = 0o755;

/// Mask held while binding; strips all group/other bits from the
/// created socket file.
const BIND_UMASK: Mode = Mode::from_bits_truncate(0o077);

/// Scoped narrowing of the process-wide file-creation mask.
///
/// The mask is global, ambient process state; modeling the narrowing
/// as a guard makes the restore run on every exit path, including ones
/// added later.
struct UmaskGuard {
    previous: Mode,
}

impl UmaskGuard {
    fn narrow(mask: Mode) -> Self {
        Self {
            previous: stat::umask(mask),
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        stat::umask(self.previous);
    }
}

/// A bound, listening control socket.
///
/// Owned exclusively by the caller; the acquirer retains no state once
/// it returns. The path is deliberately *not* unlinked on drop: a
/// graceful owner removes the file explicitly when shutting down, and
/// a crashed owner leaves a stale file that the next acquisition
/// recovers.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Path the listener is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until a management client connects.
    ///
    /// # Errors
    ///
    /// Propagates the underlying accept error.
    pub fn accept(&self) -> io::Result<(UnixStream, SocketAddr)> {
        self.listener.accept()
    }

    /// Toggle non-blocking mode on the underlying socket.
    ///
    /// # Errors
    ///
    /// Propagates the underlying fcntl error.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }

    /// Consume the handle, yielding the underlying std listener for
    /// integration into a caller-owned event loop.
    #[must_use]
    pub fn into_std(self) -> UnixListener {
        self.listener
    }

    /// Consume the handle, yielding a tokio listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Propagates failure to switch the socket to non-blocking mode or
    /// to register it with the runtime.
    pub fn into_tokio(self) -> io::Result<tokio::net::UnixListener> {
        self.listener.set_nonblocking(true)?;
        tokio::net::UnixListener::from_std(self.listener)
    }
}

impl AsRawFd for ControlListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl IntoRawFd for ControlListener {
    fn into_raw_fd(self) -> RawFd {
        self.listener.into_raw_fd()
    }
}

/// Acquire the control socket for `name` under the default runtime
/// directory.
///
/// Creates the hosting directory if absent, binds
/// `<directory>/<name>.sock` under a narrowed umask, and resolves an
/// occupied path by probing for a live listener: a reachable peer
/// aborts the acquisition, a refused connection marks the file stale
/// and it is removed before one final bind attempt.
///
/// # Errors
///
/// - [`AcquireError::Io`] for directory creation, unlink or bind
///   failures, verbatim
/// - [`AcquireError::InvalidAddress`] when the derived path cannot be
///   expressed as a unix socket address
/// - [`AcquireError::InUse`] when another process is listening on the
///   path
pub fn acquire(name: &str) -> Result<ControlListener, AcquireError> {
    acquire_in(socket_directory(), name)
}

/// Acquire the control socket for `name` under an explicit hosting
/// directory.
///
/// Entry point for embedders and tests that relocate the runtime tree;
/// semantics are identical to [`acquire`].
///
/// # Errors
///
/// See [`acquire`].
pub fn acquire_in(directory: &Path, name: &str) -> Result<ControlListener, AcquireError> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIRECTORY_MODE)
        .create(directory)?;

    let path = socket_path_in(directory, name);

    // A path the OS cannot express as a socket address is the caller's
    // mistake; catch it before touching the filesystem further.
    if let Err(err) = nix::sys::socket::UnixAddr::new(path.as_path()) {
        return Err(AcquireError::InvalidAddress { path, source: err });
    }

    // Held across both bind attempts and the recovery hop, restored
    // when this function returns by any path.
    let _mask = UmaskGuard::narrow(BIND_UMASK);

    match UnixListener::bind(&path) {
        Ok(listener) => {
            debug!(path = ?path, "control socket bound");
            return Ok(ControlListener { listener, path });
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {}
        Err(err) => return Err(err.into()),
    }

    // The path is occupied. A reachable listener means another
    // instance owns it and must not be disturbed; a refused connect
    // means the previous owner died without unlinking.
    if UnixStream::connect(&path).is_ok() {
        return Err(AcquireError::InUse { path });
    }

    warn!(path = ?path, "removing stale control socket");
    std::fs::remove_file(&path)?;

    // Exactly one retry. A concurrent recreation of the path between
    // the unlink and this bind surfaces as the bind error.
    let listener = UnixListener::bind(&path)?;
    debug!(path = ?path, "control socket bound after stale recovery");
    Ok(ControlListener { listener, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umask_guard_restores_previous_mask() {
        let ambient = stat::umask(Mode::from_bits_truncate(0o022));
        {
            let _guard = UmaskGuard::narrow(BIND_UMASK);
            // Read the active mask back by setting and re-setting it.
            let active = stat::umask(BIND_UMASK);
            assert_eq!(active, BIND_UMASK);
        }
        let restored = stat::umask(ambient);
        assert_eq!(restored, Mode::from_bits_truncate(0o022));
    }

    #[test]
    fn test_bind_umask_strips_group_and_other() {
        assert_eq!(BIND_UMASK.bits() & 0o077, 0o077);
        assert_eq!(BIND_UMASK.bits() & 0o700, 0);
    }
}
