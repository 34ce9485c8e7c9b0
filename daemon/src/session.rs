/// Side-effect collaborators: locking the session and launching the
/// configured script.
///
/// On non-Windows platforms both functions compile; `lock_session` succeeds
/// as a no-op so the dispatch path stays exercisable.
use anyhow::Result;
use std::path::Path;

use crate::logger::Logger;

/// Locks the interactive session.
///
/// A refusal from the OS is fatal for the agent: there is no point in a
/// lock-on-close daemon that cannot lock.
pub fn lock_session() -> Result<()> {
    #[cfg(windows)]
    {
        imp::lock_session()?;
    }
    Ok(())
}

/// Launches `path` detached, fire-and-forget: nothing is awaited and the
/// script's exit status is never observed. A spawn error is surfaced as a
/// single log line and otherwise ignored.
pub fn launch_script(path: &Path, logger: &Logger) {
    logger.line(&format!("launching script {}", path.display()));
    if let Err(e) = std::process::Command::new(path).spawn() {
        logger.line(&format!("script launch failed: {e}"));
        eprintln!("[session] Failed to launch {}: {e}", path.display());
    }
}

#[cfg(windows)]
mod imp {
    use anyhow::{Context, Result};
    use windows::Win32::System::Shutdown::LockWorkStation;

    pub fn lock_session() -> Result<()> {
        unsafe { LockWorkStation() }.context("LockWorkStation refused")
    }
}
