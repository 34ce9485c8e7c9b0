use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Appends timestamped lines to an optional destination file.
///
/// Without a destination every call is a no-op, so callers never need to
/// check whether logging is configured. A write failure is reported to
/// stderr and swallowed — a broken log file must never take the daemon down.
#[derive(Clone)]
pub struct Logger {
    file: Option<Arc<Mutex<File>>>,
}

impl Logger {
    /// Opens `path` in append mode, creating it if necessary.
    /// Returns an error only when a destination was requested but cannot
    /// be opened (a usage-level problem worth failing startup for).
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Some(Arc::new(Mutex::new(file))) })
    }

    /// A logger with no destination; `line` does nothing.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Appends one timestamped line. Infallible by policy.
    pub fn line(&self, text: &str) {
        let Some(file) = &self.file else { return };
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = match file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{stamp} {text}") {
            eprintln!("[logger] Failed to append log line: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── disabled logger ───────────────────────────────────────────────────────

    #[test]
    fn disabled_logger_is_not_enabled() {
        assert!(!Logger::disabled().is_enabled());
    }

    #[test]
    fn disabled_logger_line_is_a_no_op() {
        // Must not panic or create any file.
        Logger::disabled().line("nothing to see");
    }

    // ── file logger ───────────────────────────────────────────────────────────

    #[test]
    fn to_file_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let logger = Logger::to_file(&path).unwrap();
        assert!(logger.is_enabled());
        assert!(path.exists());
    }

    #[test]
    fn line_appends_timestamp_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let logger = Logger::to_file(&path).unwrap();

        logger.line("lid closed");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("lid closed\n"));
        // "YYYY-MM-DD HH:MM:SS " prefix before the text.
        assert_eq!(content.len(), "YYYY-MM-DD HH:MM:SS ".len() + "lid closed\n".len());
    }

    #[test]
    fn lines_accumulate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let logger = Logger::to_file(&path).unwrap();

        logger.line("first");
        logger.line("second");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn to_file_appends_to_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "pre-existing\n").unwrap();

        Logger::to_file(&path).unwrap().line("appended");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("pre-existing\n"));
        assert!(content.trim_end().ends_with("appended"));
    }

    #[test]
    fn to_file_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        assert!(Logger::to_file(dir.path()).is_err());
    }

    #[test]
    fn clones_share_the_same_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let logger = Logger::to_file(&path).unwrap();
        let clone = logger.clone();

        logger.line("from original");
        clone.line("from clone");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
