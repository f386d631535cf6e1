use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::error::{RenderError, RenderResult};
use crate::job::new_command_id;

/// The "comm" file telling the emulator which replay to play
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFile {
    pub mode: String,
    pub replay: String,
    pub is_real_time_mode: bool,
    /// Must change between launches or the emulator ignores a repeated replay
    pub command_id: String,
}

impl ControlFile {
    /// Normal playback of `replay` with a fresh command id
    pub fn playback(replay: &Path) -> Self {
        Self {
            mode: "normal".to_string(),
            replay: replay.to_string_lossy().to_string(),
            is_real_time_mode: false,
            command_id: new_command_id(),
        }
    }
}

/// Control file location for a job
pub fn control_file_path(working_dir: &Path, job_id: &str) -> PathBuf {
    working_dir.join(format!("slippi-comm-{}.txt", job_id))
}

/// A written control file, removed when dropped
#[derive(Debug)]
pub struct ControlFileGuard {
    path: PathBuf,
}

impl ControlFileGuard {
    pub fn write(path: PathBuf, control: &ControlFile) -> RenderResult<Self> {
        let json = serde_json::to_string(control)
            .map_err(|e| RenderError::Setup(format!("failed to serialize control file: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RenderError::io(parent, e))?;
        }
        fs::write(&path, json).map_err(|e| RenderError::io(&path, e))?;
        debug!("Wrote control file {} (commandId {})", path.display(), control.command_id);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed control file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove control file {}: {}", self.path.display(), e),
        }
    }
}
