use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a single render job
#[derive(Debug, Error)]
pub enum RenderError {
    /// Workspace copy failed or a required path is missing
    #[error("setup failed: {0}")]
    Setup(String),

    /// The emulator finished (or was stopped) without leaving a usable dump
    #[error("{kind} dump missing: {}", path.display())]
    ArtifactMissing { kind: ArtifactKind, path: PathBuf },

    /// Could not read the frame count from the replay
    #[error("failed to read replay metadata from {}: {reason}", path.display())]
    Replay { path: PathBuf, reason: String },

    /// Emulator could not be started or stopped
    #[error("emulator process error: {0}")]
    Process(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RenderError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Which half of the emulator dump was not found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Audio,
    Video,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Audio => write!(f, "audio"),
            ArtifactKind::Video => write!(f, "frame"),
        }
    }
}

/// Failures from the external encoder
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to launch encoder {}: {source}", bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder failed (exit code {exit_code})\nCommand: {command}\nSTDERR:\n{stderr}")]
    Failed {
        exit_code: i32,
        command: String,
        stderr: String,
    },

    #[error("encoder exited cleanly but produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("failed to write concat manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
