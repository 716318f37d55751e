//! ctlsock-core - Exclusive Control Socket Acquisition
//!
//! This crate owns exactly one job: turning a logical name into an
//! exclusively-held, hardened-permission unix listening socket that a
//! daemon can expose its management interface on. It does not define
//! the protocol spoken over the socket and it does not run the accept
//! loop; the caller receives a [`ControlListener`] and takes it from
//! there.
//!
//! # Acquisition Flow
//!
//! ```text
//! acquire(name)
//!     │
//!     ├─ ensure <runtime-dir>/ exists (0755)
//!     ├─ derive <runtime-dir>/<name>.sock
//!     ├─ validate as a bindable unix address
//!     ├─ narrow umask to 0077 (scoped, always restored)
//!     └─ bind + listen
//!           ├─ ok ──────────────────────────► ControlListener
//!           └─ address in use
//!                 ├─ probe connect ok ──────► Err(InUse)
//!                 └─ probe refused
//!                       ├─ unlink stale file
//!                       └─ bind + listen (once) ─► ControlListener | Err
//! ```
//!
//! # Security
//!
//! - Socket files are created under a 0077 umask, so they are never
//!   briefly group- or world-accessible, even if another thread is
//!   creating files concurrently.
//! - A live listener owned by another process is never unlinked; only
//!   a path that refuses connections is treated as stale.
//! - Unix domain sockets only, no network exposure.
//!
//! # Key Types
//!
//! - [`acquire()`] / [`acquire_in`]: the one-shot acquisition procedure
//! - [`ControlListener`]: the bound, listening handle
//! - [`AcquireError`]: the error taxonomy, with errno-style codes for
//!   embedders via [`AcquireError::code`]

pub mod acquire;
pub mod errors;
pub mod paths;

pub use acquire::{acquire, acquire_in, ControlListener};
pub use errors::AcquireError;
pub use paths::{socket_directory, socket_path};
