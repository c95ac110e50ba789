//! Binding the broker's Unix socket.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

/// Binds the first candidate that accepts a listener.
///
/// For each candidate: create the parent directory if missing, clear a stale
/// socket left by a dead process, then bind. A candidate held by a live
/// listener, or occupied by a non-socket file, is skipped.
pub fn bind_first_available(candidates: &[PathBuf]) -> Result<(PathBuf, UnixListener)> {
  if candidates.is_empty() {
    bail!("console broker: no socket candidates provided");
  }
  let mut failures = Vec::with_capacity(candidates.len());
  for path in candidates {
    match bind_candidate(path) {
      Ok(listener) => {
        info!("Bound console socket at {}", path.display());
        return Ok((path.clone(), listener));
      }
      Err(e) => {
        debug!("Skipping socket candidate {}: {e:#}", path.display());
        failures.push(format!("{}: {e:#}", path.display()));
      }
    }
  }
  bail!(
    "console broker: no usable UNIX socket path ({})",
    failures.join("; ")
  )
}

fn bind_candidate(path: &Path) -> Result<UnixListener> {
  if let Some(dir) = path.parent()
    && !dir.as_os_str().is_empty()
    && !dir.exists()
  {
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    debug!("Created socket directory {} (0700)", dir.display());
  }
  clear_stale_socket(path)?;
  UnixListener::bind(path).with_context(|| format!("bind unix listener at {}", path.display()))
}

fn clear_stale_socket(path: &Path) -> Result<()> {
  let meta = match fs::symlink_metadata(path) {
    Ok(meta) => meta,
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
  };
  if !meta.file_type().is_socket() {
    bail!("{} exists and is not a socket", path.display());
  }
  if UnixStream::connect(path).is_ok() {
    bail!("{} is held by a live listener", path.display());
  }
  info!("Removing stale socket {}", path.display());
  fs::remove_file(path).with_context(|| format!("remove stale socket {}", path.display()))
}

/// Restricts the socket to the owning user (best-effort).
pub fn restrict_to_owner(path: &Path) {
  if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
    warn!("Failed to set 0600 on {}: {e}", path.display());
  }
}

/// Removes the socket file (best-effort).
pub fn remove_socket_file(path: &Path) {
  match fs::remove_file(path) {
    Ok(()) => debug!("Removed socket {}", path.display()),
    Err(e) if e.kind() == ErrorKind::NotFound => {}
    Err(e) => warn!("Failed to remove socket {}: {e}", path.display()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("nested").join("deeper").join("c.sock");
    let (path, _listener) = bind_first_available(std::slice::from_ref(&sock)).unwrap();
    assert_eq!(path, sock);
    let mode = fs::metadata(sock.parent().unwrap()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
  }

  #[test]
  fn stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("stale.sock");
    drop(UnixListener::bind(&sock).unwrap());
    assert!(sock.exists());

    let (path, _listener) = bind_first_available(std::slice::from_ref(&sock)).unwrap();
    assert_eq!(path, sock);
    assert!(UnixStream::connect(&sock).is_ok());
  }

  #[test]
  fn live_and_regular_file_candidates_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("live.sock");
    let _other = UnixListener::bind(&live).unwrap();
    let plain = dir.path().join("plain.sock");
    fs::write(&plain, "keep me").unwrap();
    let free = dir.path().join("free.sock");

    let (path, _listener) =
      bind_first_available(&[live.clone(), plain.clone(), free.clone()]).unwrap();
    assert_eq!(path, free);
    assert_eq!(fs::read_to_string(&plain).unwrap(), "keep me");
    assert!(live.exists());
  }

  #[test]
  fn exhausted_candidates_report_every_reason() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("plain");
    fs::write(&plain, "").unwrap();
    let err = bind_first_available(&[plain]).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("no usable UNIX socket path"), "{msg}");
    assert!(msg.contains("not a socket"), "{msg}");

    let err = bind_first_available(&[]).unwrap_err();
    assert!(err.to_string().contains("no socket candidates"));
  }

  #[test]
  fn restrict_and_remove_socket() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("perm.sock");
    let _listener = UnixListener::bind(&sock).unwrap();
    restrict_to_owner(&sock);
    let mode = fs::metadata(&sock).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    remove_socket_file(&sock);
    assert!(!sock.exists());
    remove_socket_file(&sock);
  }
}
