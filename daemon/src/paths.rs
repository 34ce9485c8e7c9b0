/// Canonical names for the single-instance rendezvous points.
///
/// Both names derive from the application identity so that every invocation,
/// regardless of working directory, lands on the same lock and the same
/// control endpoint.
///
///   - Unix:    a flock'ed lock file and a Unix domain socket under
///              $XDG_RUNTIME_DIR (falling back to /tmp).
///   - Windows: a named mutex and a named pipe.
use std::path::PathBuf;

pub const LOCK_FILE_NAME: &str = "lidlock.lock";
pub const SOCKET_FILE_NAME: &str = "lidlock.sock";

#[cfg(windows)]
pub const MUTEX_NAME: &str = "Local\\lidlock-instance";
#[cfg(windows)]
pub const PIPE_NAME: &str = r"\\.\pipe\lidlock-control";

/// Directory holding the per-user runtime files on Unix.
#[cfg(unix)]
pub fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("/tmp"),
    }
}

/// Path of the named global lock file: <runtime>/lidlock.lock
#[cfg(unix)]
pub fn lock_file_path() -> PathBuf {
    runtime_dir().join(LOCK_FILE_NAME)
}

/// Path of the Primary's control endpoint: <runtime>/lidlock.sock
#[cfg(unix)]
pub fn endpoint_path() -> PathBuf {
    runtime_dir().join(SOCKET_FILE_NAME)
}
