//! Socket Path Derivation
//!
//! Every control socket on a host lives under one shared runtime
//! directory, as `<directory>/<name>.sock`. Derivation is pure: no
//! filesystem access happens here.
//!
//! The directory defaults to `/var/run/ctlsock` and can be overridden
//! at build time by setting `CTLSOCK_RUNTIME_DIR`, for embedding
//! scenarios that relocate the runtime tree.

use std::path::{Path, PathBuf};

/// Shared runtime directory hosting all control sockets.
const SOCKET_DIRECTORY: &str = match option_env!("CTLSOCK_RUNTIME_DIR") {
    Some(dir) => dir,
    None => "/var/run/ctlsock",
};

/// The process-wide hosting directory for control sockets.
#[must_use]
pub fn socket_directory() -> &'static Path {
    Path::new(SOCKET_DIRECTORY)
}

/// Derive the canonical socket path for `name` under the default
/// directory.
///
/// The name is treated as opaque and is not sanitized; a caller that
/// embeds path separators gets whatever path that produces.
#[must_use]
pub fn socket_path(name: &str) -> PathBuf {
    socket_path_in(socket_directory(), name)
}

/// Derive the socket path for `name` under an explicit directory.
#[must_use]
pub fn socket_path_in(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}.sock"))
}
