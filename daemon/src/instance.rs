/// Single-instance coordination: the claim-or-discover protocol.
///
/// At startup every invocation tries to claim a named, system-global lock.
/// The claimer becomes the Primary and holds the lock for its entire
/// lifetime (the OS releases it on any exit, clean or crash). Everyone else
/// is a Secondary: it locates the Primary's control endpoint by name,
/// delivers exactly one [`ControlSignal`], and exits.
///
/// The lock claim and the endpoint registration are not atomic: a Secondary
/// racing a starting Primary may observe "lock held, endpoint missing".
/// That inconsistent state is fatal for the Secondary — it must never guess
/// its way into becoming a second Primary, since two Primaries would both
/// try to lock the session.
///
///   - Unix:    flock'ed lock file + Unix domain socket.
///   - Windows: named mutex + named pipe.
use anyhow::{bail, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::event::AgentEvent;

/// Clients must deliver their signal within this period; a silent
/// connection is closed without routing anything.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a Secondary waits for the Primary's acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Acknowledgement line sent by the Primary once a signal has been routed.
const ACK: &str = "ok";

/// Longest control line a client may send. Anything beyond this is a
/// misbehaving sender; the read is truncated and decodes as `Probe`.
const MAX_LINE_LEN: u64 = 64;

// ── Control signals ───────────────────────────────────────────────────────────

/// An inter-process message used only for single-instance coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Ask the Primary to shut down after its current dispatch.
    Terminate,
    /// Detect a live Primary without affecting it.
    Probe,
}

impl ControlSignal {
    /// Whether routing this signal transitions the main loop to shutdown.
    pub fn is_terminate(self) -> bool {
        matches!(self, ControlSignal::Terminate)
    }

    /// Wire encoding: one ASCII word, newline-terminated by the sender.
    pub fn to_wire(self) -> &'static str {
        match self {
            ControlSignal::Terminate => "terminate",
            ControlSignal::Probe => "probe",
        }
    }

    /// Decodes a wire line. Anything that is not a well-formed `terminate`
    /// decodes as `Probe`: an unrecognized signal from a misbehaving sender
    /// must be observed and ignored, never acted on.
    pub fn from_wire(line: &str) -> Self {
        match line.trim() {
            "terminate" => ControlSignal::Terminate,
            _ => ControlSignal::Probe,
        }
    }
}

// ── Roles ─────────────────────────────────────────────────────────────────────

/// Resolved once at startup and never changed for the life of the process.
pub enum InstanceRole {
    /// This process claimed the global lock; the guard keeps it held.
    Primary(PrimaryGuard),
    /// Another process holds the lock; deliver one signal and exit.
    Secondary,
}

pub use imp::{ControlEndpoint, PrimaryGuard};

/// Claims or observes the named global lock using the platform defaults.
pub fn acquire_role() -> Result<InstanceRole> {
    imp::acquire_role_default()
}

/// Registers the Primary's control endpoint under its well-known name.
/// Called only after the lock has been claimed.
pub fn bind_endpoint() -> Result<ControlEndpoint> {
    imp::bind_endpoint_default()
}

/// Connects to a live Primary's endpoint and delivers one signal.
/// An unreachable endpoint while the lock is held is the inconsistent-state
/// condition described in the module docs; the error says so.
pub async fn notify_primary(signal: ControlSignal) -> Result<()> {
    imp::notify_primary_default(signal).await
}

pub use imp::serve;

#[cfg(unix)]
pub use imp::{acquire_role_at, bind_endpoint_at, notify_primary_at};

// ── Shared line protocol ──────────────────────────────────────────────────────

/// Serves one control client: read one line (bounded, with timeout), route
/// the decoded signal into the event channel, acknowledge.
///
/// Every abnormal path — timeout, disconnect before a full line, a channel
/// already closed by shutdown — ends the connection without an ack, which a
/// Secondary reports as non-delivery.
async fn handle_client<S>(stream: S, tx: mpsc::Sender<AgentEvent>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half.take(MAX_LINE_LEN));
    let mut line = String::new();

    let bytes_read = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        // Client never sent its signal; close silently.
        Err(_) => return Ok(()),
    };
    if bytes_read == 0 {
        return Ok(()); // Client disconnected.
    }

    let signal = ControlSignal::from_wire(&line);
    if tx.send(AgentEvent::Control(signal)).await.is_err() {
        // Main loop already gone; the sender gets no ack.
        return Ok(());
    }

    write_half.write_all(ACK.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

/// The Secondary's side of the exchange: send the signal line, wait for the
/// Primary's acknowledgement.
async fn deliver_signal<S>(stream: S, signal: ControlSignal) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    write_half.write_all(signal.to_wire().as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let mut reader = BufReader::new(read_half.take(MAX_LINE_LEN));
    let mut line = String::new();
    match timeout(ACK_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(_)) if line.trim() == ACK => Ok(()),
        Ok(Ok(_)) => bail!("running instance closed the connection without acknowledging"),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("running instance did not acknowledge within {ACK_TIMEOUT:?}"),
    }
}

// ── Unix implementation ───────────────────────────────────────────────────────

#[cfg(unix)]
mod imp {
    use anyhow::{Context, Result};
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use std::fs::{File, OpenOptions};
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;

    use super::{ControlSignal, InstanceRole};
    use crate::event::AgentEvent;
    use crate::paths;

    /// Holds the advisory lock on the lock file. Dropping it (or dying with
    /// it) releases the lock; the kernel guarantees release on process exit
    /// by any means, which is what makes crash recovery work.
    pub struct PrimaryGuard {
        _lock: Flock<File>,
    }

    /// The Primary's bound control socket. The socket file is removed again
    /// on drop so a clean shutdown leaves nothing behind.
    pub struct ControlEndpoint {
        listener: UnixListener,
        path: PathBuf,
    }

    impl Drop for ControlEndpoint {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub fn acquire_role_default() -> Result<InstanceRole> {
        acquire_role_at(&paths::lock_file_path())
    }

    /// Tries a non-blocking exclusive flock on `lock_path`.
    ///
    /// Success means no other instance holds the lock: this process is the
    /// Primary and keeps holding it. EWOULDBLOCK means a live process owns
    /// it: this process is a Secondary. Note the window between this claim
    /// and [`bind_endpoint_at`]: a Secondary arriving inside it finds the
    /// lock held but the endpoint missing, and fails fast.
    pub fn acquire_role_at(lock_path: &Path) -> Result<InstanceRole> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(InstanceRole::Primary(PrimaryGuard { _lock: lock })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(InstanceRole::Secondary),
            Err((_, errno)) => Err(anyhow::anyhow!(
                "Failed to lock {}: {errno}",
                lock_path.display()
            )),
        }
    }

    pub fn bind_endpoint_default() -> Result<ControlEndpoint> {
        bind_endpoint_at(&paths::endpoint_path())
    }

    /// Binds the control socket at `path`.
    ///
    /// Only the lock holder calls this, so a pre-existing socket file can
    /// only be debris from a crashed predecessor and is removed first.
    pub fn bind_endpoint_at(path: &Path) -> Result<ControlEndpoint> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        Ok(ControlEndpoint { listener, path: path.to_path_buf() })
    }

    /// Accepts control clients forever, one task per connection.
    pub async fn serve(endpoint: ControlEndpoint, tx: mpsc::Sender<AgentEvent>) {
        loop {
            let stream = match endpoint.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    eprintln!("[instance] Control socket accept failed: {e}");
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = super::handle_client(stream, tx).await {
                    eprintln!("[instance] Control client error: {e}");
                }
            });
        }
    }

    pub async fn notify_primary_default(signal: ControlSignal) -> Result<()> {
        notify_primary_at(&paths::endpoint_path(), signal).await
    }

    /// Delivers one signal to the Primary listening at `path`.
    pub async fn notify_primary_at(path: &Path, signal: ControlSignal) -> Result<()> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "a running instance holds the lock but its control endpoint \
                 {} is unreachable (still starting up, or died uncleanly)",
                path.display()
            )
        })?;
        super::deliver_signal(stream, signal).await
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use anyhow::{Context, Result};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
    use tokio::sync::mpsc;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE};
    use windows::Win32::System::Threading::CreateMutexW;

    use super::{ControlSignal, InstanceRole};
    use crate::event::AgentEvent;
    use crate::paths;

    /// Converts a Rust `&str` to a null-terminated UTF-16 `Vec<u16>`.
    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Holds the named mutex for the process lifetime. The OS releases the
    /// mutex when the last handle closes, including on a crash.
    pub struct PrimaryGuard {
        mutex: HANDLE,
    }

    impl Drop for PrimaryGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.mutex);
            }
        }
    }

    /// The first server instance of the control pipe. Holding it keeps the
    /// pipe name registered until the accept loop takes over.
    pub struct ControlEndpoint {
        server: NamedPipeServer,
    }

    /// Creates (or opens) the named instance mutex.
    ///
    /// `ERROR_ALREADY_EXISTS` after a successful create means another
    /// process made it first: this invocation is a Secondary. Note the
    /// window between this claim and [`bind_endpoint_default`]: a Secondary
    /// arriving inside it finds the mutex held but the pipe missing, and
    /// fails fast.
    pub fn acquire_role_default() -> Result<InstanceRole> {
        let name = to_wide(paths::MUTEX_NAME);
        let mutex = unsafe { CreateMutexW(None, false, PCWSTR(name.as_ptr())) }
            .context("CreateMutexW failed")?;
        let already_exists = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;

        if already_exists {
            unsafe {
                let _ = CloseHandle(mutex);
            }
            Ok(InstanceRole::Secondary)
        } else {
            Ok(InstanceRole::Primary(PrimaryGuard { mutex }))
        }
    }

    /// Registers the control pipe under its well-known name.
    pub fn bind_endpoint_default() -> Result<ControlEndpoint> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(paths::PIPE_NAME)
            .with_context(|| format!("Failed to create control pipe {}", paths::PIPE_NAME))?;
        Ok(ControlEndpoint { server })
    }

    /// Accepts control clients forever. Each accepted connection is replaced
    /// with a fresh server instance before being handled, so the pipe name
    /// stays registered throughout.
    ///
    /// Losing the pipe name is fatal: a Primary without a control endpoint
    /// could never again be reached by a `-kill` invocation, so there is no
    /// degraded mode to continue in.
    pub async fn serve(mut endpoint: ControlEndpoint, tx: mpsc::Sender<AgentEvent>) {
        loop {
            if let Err(e) = endpoint.server.connect().await {
                eprintln!("[instance] Control pipe connect failed: {e}");
                continue;
            }
            let next = match ServerOptions::new().create(paths::PIPE_NAME) {
                Ok(server) => server,
                Err(e) => {
                    eprintln!("[instance] Failed to re-create control pipe: {e}");
                    std::process::exit(1);
                }
            };
            let client = std::mem::replace(&mut endpoint.server, next);
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = super::handle_client(client, tx).await {
                    eprintln!("[instance] Control client error: {e}");
                }
            });
        }
    }

    /// Delivers one signal to the Primary's control pipe.
    pub async fn notify_primary_default(signal: ControlSignal) -> Result<()> {
        let client = ClientOptions::new().open(paths::PIPE_NAME).with_context(|| {
            format!(
                "a running instance holds the mutex but its control pipe \
                 {} is unreachable (still starting up, or died uncleanly)",
                paths::PIPE_NAME
            )
        })?;
        super::deliver_signal(client, signal).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
