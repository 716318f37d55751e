//! Integration tests for control socket acquisition.
//!
//! Acquisition transiently narrows the process-wide umask, so every
//! test that acquires a socket or asserts on the mask serializes on
//! `UMASK_LOCK` (MutexGuard held across await is intentional: the
//! mask is process-global state).

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ctlsock_core::errors::{ERR_INVALID, ERR_IN_USE};
use ctlsock_core::{acquire_in, AcquireError};

static UMASK_LOCK: Mutex<()> = Mutex::new(());

fn umask_lock() -> MutexGuard<'static, ()> {
    UMASK_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_umask(bits: u32) -> nix::sys::stat::Mode {
    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(
        bits as nix::libc::mode_t,
    ))
}

#[test]
fn test_acquire_on_free_path_succeeds() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();

    let listener = acquire_in(tmp.path(), "ctl0").unwrap();

    assert_eq!(listener.path(), tmp.path().join("ctl0.sock"));
    let metadata = std::fs::metadata(listener.path()).unwrap();
    assert!(metadata.file_type().is_socket());

    // The handle is immediately usable: a client can connect.
    let client = UnixStream::connect(listener.path()).unwrap();
    let (_peer, _addr) = listener.accept().unwrap();
    drop(client);
}

#[test]
fn test_acquire_creates_missing_directory() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();
    let directory = tmp.path().join("run").join("ctlsock");
    assert!(!directory.exists());

    let previous = set_umask(0o022);
    let result = acquire_in(&directory, "ctl0");
    nix::sys::stat::umask(previous);

    let listener = result.unwrap();
    assert!(directory.is_dir());

    // Owner full access, group/other traversal; created before the
    // bind-time mask narrowing, so the ambient 0022 applies (a no-op
    // against 0755).
    let mode = std::fs::metadata(&directory).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
    assert!(listener.path().exists());
}

#[test]
fn test_stale_socket_is_recovered() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ctl0.sock");

    // A dropped std listener leaves its socket file behind, exactly
    // like a crashed daemon.
    let stale = UnixListener::bind(&path).unwrap();
    drop(stale);
    assert!(path.exists());
    assert!(UnixStream::connect(&path).is_err());

    let listener = acquire_in(tmp.path(), "ctl0").unwrap();

    // The stale file was replaced by a functioning listener.
    let client = UnixStream::connect(&path).unwrap();
    let (_peer, _addr) = listener.accept().unwrap();
    drop(client);
}

#[test]
fn test_live_socket_is_not_disturbed() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();

    let first = acquire_in(tmp.path(), "ctl0").unwrap();

    let err = acquire_in(tmp.path(), "ctl0").unwrap_err();
    match &err {
        AcquireError::InUse { path } => assert_eq!(path.as_path(), first.path()),
        other => panic!("expected InUse, got {other:?}"),
    }
    assert_eq!(err.code(), ERR_IN_USE);

    // The original listener is still bound and reachable.
    let client = UnixStream::connect(first.path()).unwrap();
    let (_peer, _addr) = first.accept().unwrap();
    drop(client);
}

#[test]
fn test_socket_file_is_owner_only() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();

    // Fully permissive ambient mask: the hardening must not depend on
    // the caller's environment.
    let previous = set_umask(0o000);
    let listener = acquire_in(tmp.path(), "ctl0").unwrap();
    let restored = set_umask(0o000);
    nix::sys::stat::umask(previous);

    let mode = std::fs::metadata(listener.path())
        .unwrap()
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(mode & 0o077, 0, "socket must have no group/other bits");
    assert_eq!(mode, 0o700);

    // The ambient mask came back out exactly as it went in.
    assert_eq!(restored.bits(), 0);
}

#[test]
fn test_umask_restored_on_failure_path() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();
    let _owner = acquire_in(tmp.path(), "ctl0").unwrap();

    let previous = set_umask(0o022);
    let result = acquire_in(tmp.path(), "ctl0");
    assert!(matches!(result, Err(AcquireError::InUse { .. })));

    let after = set_umask(0o022);
    nix::sys::stat::umask(previous);
    assert_eq!(after.bits() & 0o777, 0o022);
}

#[test]
fn test_overlong_name_is_invalid_argument() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();
    let name = "x".repeat(300);

    let err = acquire_in(tmp.path(), &name).unwrap_err();
    assert!(matches!(err, AcquireError::InvalidAddress { .. }));
    assert_eq!(err.code(), ERR_INVALID);

    // Nothing was created for the malformed address.
    assert!(!tmp.path().join(format!("{name}.sock")).exists());
}

#[test]
fn test_handle_exposes_raw_fd() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();

    let listener = acquire_in(tmp.path(), "ctl0").unwrap();
    assert!(listener.as_raw_fd() >= 0);
}

#[tokio::test]
async fn test_into_tokio_accepts_connections() {
    let _guard = umask_lock();
    let tmp = TempDir::new().unwrap();

    let listener = acquire_in(tmp.path(), "ctl0").unwrap();
    let path = listener.path().to_path_buf();
    let listener = listener.into_tokio().unwrap();

    let client = tokio::spawn(async move {
        let _stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    });

    let (_stream, _addr) = listener.accept().await.unwrap();
    client.await.unwrap();
}
