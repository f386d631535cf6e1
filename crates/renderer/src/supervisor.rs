use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use crate::config::RenderConfig;
use crate::control::{ControlFile, ControlFileGuard};
use crate::error::{ArtifactKind, RenderError, RenderResult};
use crate::ini::IniSettingsWriter;
use crate::process::{self, Termination};
use crate::progress::{ProgressSource, RenderTimeLog};
use crate::workspace::Workspace;

/// Time between progress checks
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Ceiling on a single render (8m10s)
pub const MAX_WAIT: Duration = Duration::from_secs(8 * 60 + 10);
/// How long the emulator gets to exit after being asked to stop
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub terminate_grace: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            max_wait: MAX_WAIT,
            terminate_grace: TERMINATE_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Prepared,
    Launched,
    Polling,
    Completed,
    TimedOut,
    ProcessExited,
    Terminating,
    Done,
}

/// Why the polling loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { frames: i64 },
    TimedOut { frames: i64 },
    ProcessExited { frames: i64 },
}

impl PollOutcome {
    fn state(&self) -> SupervisorState {
        match self {
            PollOutcome::Completed { .. } => SupervisorState::Completed,
            PollOutcome::TimedOut { .. } => SupervisorState::TimedOut,
            PollOutcome::ProcessExited { .. } => SupervisorState::ProcessExited,
        }
    }
}

/// Dump files recovered after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredArtifacts {
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
}

/// What to launch
#[derive(Debug, Clone)]
pub struct EmulatorSettings {
    pub dolphin_bin: PathBuf,
    pub melee_iso: PathBuf,
}

impl EmulatorSettings {
    pub fn from_config(cfg: &RenderConfig) -> Self {
        Self {
            dolphin_bin: cfg.dolphin_bin(),
            melee_iso: cfg.melee_iso.clone(),
        }
    }
}

/// Drives one emulator run inside a job's workspace.
///
/// The emulator has no completion callback; its progress log grows by one
/// line per rendered frame. A run moves through
/// `Idle -> Prepared -> Launched -> Polling -> {Completed | TimedOut | ProcessExited} -> Terminating -> Done`.
pub struct RenderSupervisor<'a> {
    workspace: &'a Workspace,
    control_path: PathBuf,
    emulator: EmulatorSettings,
    ini_writer: IniSettingsWriter,
    progress: Box<dyn ProgressSource>,
    timings: SupervisorTimings,
    state: SupervisorState,
}

impl<'a> RenderSupervisor<'a> {
    pub fn new(
        workspace: &'a Workspace,
        control_path: PathBuf,
        emulator: EmulatorSettings,
        ini_writer: IniSettingsWriter,
    ) -> Self {
        Self {
            progress: Box::new(RenderTimeLog::new(workspace.render_time_log.clone())),
            workspace,
            control_path,
            emulator,
            ini_writer,
            timings: SupervisorTimings::default(),
            state: SupervisorState::Idle,
        }
    }

    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Replace the file-backed progress log with another completion signal
    pub fn with_progress_source(mut self, progress: Box<dyn ProgressSource>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Render `replay` and return the dump files.
    ///
    /// Fails with [`RenderError::ArtifactMissing`] when no dump was produced.
    /// A timeout or early exit alone never fails the run.
    pub async fn run(&mut self, replay: &Path, expected_frame_count: i64) -> RenderResult<RecoveredArtifacts> {
        let job_id = self.workspace.job_id.clone();

        self.prepare()?;

        // The control file lives exactly as long as the emulator run
        let outcome = {
            let control = ControlFileGuard::write(self.control_path.clone(), &ControlFile::playback(replay))?;
            let mut child = self.launch(control.path())?;

            self.state = SupervisorState::Polling;
            let outcome = poll_progress(
                self.progress.as_ref(),
                expected_frame_count,
                || has_exited(&mut child),
                &self.timings,
                &job_id,
            )
            .await;
            self.state = outcome.state();

            match outcome {
                PollOutcome::Completed { frames } => {
                    info!("Job {}: render complete ({} / {} frames)", job_id, frames, expected_frame_count);
                }
                PollOutcome::TimedOut { frames } => {
                    warn!(
                        "Job {}: timed out after {:?} waiting for render ({} / {} frames), recovering partial dump",
                        job_id, self.timings.max_wait, frames, expected_frame_count
                    );
                }
                PollOutcome::ProcessExited { frames } => {
                    warn!(
                        "Job {}: emulator exited before replay finished ({} / {} frames) - may not have recorded entire replay",
                        job_id, frames, expected_frame_count
                    );
                }
            }

            self.state = SupervisorState::Terminating;
            match process::terminate(&mut child, self.timings.terminate_grace).await? {
                Termination::Killed => warn!("Job {}: emulator had to be killed", job_id),
                other => debug!("Job {}: emulator stopped: {:?}", job_id, other),
            }
            outcome
        };

        self.state = SupervisorState::Done;
        let artifacts = resolve_artifacts(self.workspace)?;
        debug!(
            "Job {}: recovered video {} and audio {} after {:?}",
            job_id,
            artifacts.video_path.display(),
            artifacts.audio_path.display(),
            outcome
        );
        Ok(artifacts)
    }

    /// Idle -> Prepared
    fn prepare(&mut self) -> RenderResult<()> {
        let ws = self.workspace;
        self.ini_writer.apply(&ws.root)?;

        RenderTimeLog::new(ws.render_time_log.clone()).clear()?;

        // Stale dumps would be picked up as this run's output
        if ws.dump_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&ws.dump_dir) {
                warn!("Job {}: failed to clear dump dir {}: {}", ws.job_id, ws.dump_dir.display(), e);
            }
        }

        // The emulator will not create these itself
        for dir in [&ws.frames_dir, &ws.audio_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| RenderError::Setup(format!("failed to create {}: {}", dir.display(), e)))?;
        }

        self.state = SupervisorState::Prepared;
        Ok(())
    }

    /// Prepared -> Launched
    fn launch(&mut self, control_file: &Path) -> RenderResult<Child> {
        let mut cmd = Command::new(&self.emulator.dolphin_bin);
        cmd.arg("-i")
            .arg(control_file)
            .arg("-b") // exit when emulation ends
            .arg("-e")
            .arg(&self.emulator.melee_iso)
            .arg("-u")
            .arg(&self.workspace.root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(
            "Job {}: launching {} -i {} -b -e {} -u {}",
            self.workspace.job_id,
            self.emulator.dolphin_bin.display(),
            control_file.display(),
            self.emulator.melee_iso.display(),
            self.workspace.root.display()
        );

        let child = cmd.spawn().map_err(|e| {
            RenderError::Process(format!(
                "failed to launch emulator {}: {}",
                self.emulator.dolphin_bin.display(),
                e
            ))
        })?;

        self.state = SupervisorState::Launched;
        Ok(child)
    }
}

fn has_exited(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => {
            warn!("Failed to poll emulator process: {}", e);
            false
        }
    }
}

/// Poll `progress` until it reaches `expected`, the ceiling passes, or the process exits.
/// Progress is checked before anything else, so `expected <= 0` returns without sleeping.
pub async fn poll_progress<P, F>(
    progress: &P,
    expected: i64,
    mut has_exited: F,
    timings: &SupervisorTimings,
    job_id: &str,
) -> PollOutcome
where
    P: ProgressSource + ?Sized,
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        let frames = progress.count_completed();
        debug!("Job {}: rendered {} / {} frames", job_id, frames, expected);

        if frames >= expected {
            return PollOutcome::Completed { frames };
        }
        if start.elapsed() > timings.max_wait {
            return PollOutcome::TimedOut { frames };
        }
        if has_exited() {
            return PollOutcome::ProcessExited { frames };
        }

        tokio::time::sleep(timings.poll_interval).await;
    }
}

/// Locate the dump files. The secondary video name takes precedence over the
/// primary when both exist.
pub fn resolve_artifacts(workspace: &Workspace) -> RenderResult<RecoveredArtifacts> {
    if !workspace.audio_file.exists() {
        return Err(RenderError::ArtifactMissing {
            kind: ArtifactKind::Audio,
            path: workspace.audio_file.clone(),
        });
    }

    let video_path = if workspace.video_secondary.exists() {
        workspace.video_secondary.clone()
    } else if workspace.video_primary.exists() {
        workspace.video_primary.clone()
    } else {
        return Err(RenderError::ArtifactMissing {
            kind: ArtifactKind::Video,
            path: workspace.video_primary.clone(),
        });
    };

    Ok(RecoveredArtifacts {
        video_path,
        audio_path: workspace.audio_file.clone(),
    })
}
