//! Acquisition Error Taxonomy
//!
//! Every failure during acquisition is returned to the caller; nothing
//! is swallowed or retried beyond the single stale-recovery hop. The
//! caller owns user-facing reporting.
//!
//! Embedding systems that speak an errno-style status protocol can map
//! any [`AcquireError`] to a negative errno via [`AcquireError::code`];
//! the `ERR_*` constants enumerate the abstract categories.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// I/O failure (directory creation, unlink, bind).
pub const ERR_IO: i32 = -libc::EIO;
/// Protocol violation on the management interface.
pub const ERR_PROTOCOL: i32 = -libc::EPROTO;
/// Malformed name or address.
pub const ERR_INVALID: i32 = -libc::EINVAL;
/// Another instance already owns the socket.
pub const ERR_IN_USE: i32 = -libc::EADDRINUSE;
/// Unclassified fallback (ENOANO).
pub const ERR_UNKNOWN: i32 = -55;

/// Errors surfaced by [`acquire`](crate::acquire::acquire).
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Filesystem or bind failure, propagated verbatim.
    #[error("control socket I/O error: {0}")]
    Io(#[from] io::Error),

    /// The derived path does not resolve to a bindable unix address
    /// (too long for `sun_path`, interior NUL).
    #[error("invalid control socket address {path:?}: {source}")]
    InvalidAddress {
        /// The path that failed to resolve.
        path: PathBuf,
        /// Underlying resolution error.
        #[source]
        source: nix::Error,
    },

    /// Another process is actively listening on the path. The live
    /// socket was left untouched.
    #[error("control socket {path:?} is already in use")]
    InUse {
        /// The occupied path.
        path: PathBuf,
    },
}

impl AcquireError {
    /// Errno-style code for embedders, as a negative errno.
    ///
    /// I/O errors carrying a raw OS errno report that errno negated;
    /// an I/O error without one falls back to [`ERR_UNKNOWN`].
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(err) => err.raw_os_error().map_or(ERR_UNKNOWN, |errno| -errno),
            Self::InvalidAddress { .. } => ERR_INVALID,
            Self::InUse { .. } => ERR_IN_USE,
        }
    }
}
