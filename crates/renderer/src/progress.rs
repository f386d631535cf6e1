use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use crate::error::{RenderError, RenderResult};

/// Observable render progress of an emulator run
pub trait ProgressSource: Send + Sync {
    /// Number of frames rendered so far
    fn count_completed(&self) -> i64;
}

/// The emulator's `render_time.txt`: one line per rendered frame
#[derive(Debug, Clone)]
pub struct RenderTimeLog {
    path: PathBuf,
}

impl RenderTimeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete a log left over from a previous run so it can't be read as current progress
    pub fn clear(&self) -> RenderResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed stale progress log {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RenderError::io(&self.path, e)),
        }
    }
}

impl ProgressSource for RenderTimeLog {
    fn count_completed(&self) -> i64 {
        match fs::read(&self.path) {
            Ok(bytes) => count_lines(&bytes) as i64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("Failed to read progress log {}: {}", self.path.display(), e);
                0
            }
        }
    }
}

/// Count lines, including a final line without a trailing newline
fn count_lines(bytes: &[u8]) -> usize {
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    match bytes.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_log_counts_zero() {
        let log = RenderTimeLog::new("/nonexistent/Logs/render_time.txt");
        assert_eq!(log.count_completed(), 0);
        log.clear().unwrap();
    }

    #[test]
    fn test_counts_lines_as_frames() {
        let dir = tempfile::tempdir().unwrap();
        let log = RenderTimeLog::new(dir.path().join("render_time.txt"));

        fs::write(log.path(), "16.6\n16.7\n16.5\n").unwrap();
        assert_eq!(log.count_completed(), 3);

        // Partially written last line still counts
        fs::write(log.path(), "16.6\n16.7\n16").unwrap();
        assert_eq!(log.count_completed(), 3);

        fs::write(log.path(), "").unwrap();
        assert_eq!(log.count_completed(), 0);
    }

    #[test]
    fn test_clear_removes_stale_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = RenderTimeLog::new(dir.path().join("render_time.txt"));
        fs::write(log.path(), "1\n2\n").unwrap();

        log.clear().unwrap();
        assert!(!log.path().exists());
        assert_eq!(log.count_completed(), 0);
    }
}
