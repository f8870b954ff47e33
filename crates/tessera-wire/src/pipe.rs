//! Named pipe endpoints.
//!
//! Endpoints are expressed with Windows-style pipe names
//! (`\\.\pipe\<name>`); on POSIX these map to UNIX domain sockets under
//! `/tmp/.pipe`. The server deletes stale sockets before binding.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::WireError;

pub const PIPE_PREFIX: &str = "\\\\.\\pipe\\";
const PIPE_DIR: &str = "/tmp/.pipe";

/// Deterministic endpoint name for a session-scoped service.
#[must_use]
pub fn endpoint_name(id: u32, endpoint: &str) -> String {
    format!("{PIPE_PREFIX}tessera_{id}_{endpoint}")
}

/// Filesystem path backing a pipe name. Accepts both the full
/// `\\.\pipe\…` spelling and a bare name.
#[must_use]
pub fn pipe_path(name: &str) -> PathBuf {
    let bare = name.strip_prefix(PIPE_PREFIX).unwrap_or(name);
    PathBuf::from(PIPE_DIR).join(bare)
}

/// Remove a stale socket, ignoring "not found".
pub fn clean(name: &str) -> Result<(), WireError> {
    match std::fs::remove_file(pipe_path(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WireError::Io(e)),
    }
}

/// Bind a listening pipe, replacing any stale socket.
pub fn create(name: &str) -> Result<UnixListener, WireError> {
    let path = pipe_path(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    clean(name)?;
    let listener = UnixListener::bind(&path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Connect to a pipe, retrying until `timeout` elapses (the peer may
/// still be starting up). The returned stream is non-blocking.
pub fn connect(name: &str, timeout: Duration) -> Result<UnixStream, WireError> {
    let path = pipe_path(name);
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(&path) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                return Ok(stream);
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(WireError::Io(e));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_pipe_dir() {
        let name = endpoint_name(7, "session");
        assert_eq!(name, "\\\\.\\pipe\\tessera_7_session");
        assert_eq!(pipe_path(&name), PathBuf::from("/tmp/.pipe/tessera_7_session"));
        assert_eq!(pipe_path("plain"), PathBuf::from("/tmp/.pipe/plain"));
    }

    #[test]
    fn create_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        // Bind directly twice through the helper path logic by pointing
        // at a scratch name; create() must clean the first socket.
        let l1 = UnixListener::bind(&path).unwrap();
        drop(l1);
        // A second bind on the leftover inode fails without cleanup.
        assert!(UnixListener::bind(&path).is_err());
        std::fs::remove_file(&path).unwrap();
        assert!(UnixListener::bind(&path).is_ok());
    }

    #[test]
    fn connect_times_out_on_missing_peer() {
        let err = connect("tessera_test_no_such_endpoint", Duration::from_millis(120));
        assert!(err.is_err());
    }
}
