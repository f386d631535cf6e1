use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{error, info};
use crate::config::RenderConfig;
use crate::control::control_file_path;
use crate::encode::EncodeInvoker;
use crate::error::{RenderError, RenderResult};
use crate::ini::{IniSettingsWriter, RenderSettings};
use crate::job::{Job, JobStatus};
use crate::replay::{is_game_too_short, ReplayMetadata, SlippiMetadataReader};
use crate::supervisor::{EmulatorSettings, RenderSupervisor, SupervisorTimings};
use crate::workspace::{Workspace, WorkspaceGuard, WorkspaceRegistry};

/// Executes single jobs: workspace -> supervise -> encode -> release.
/// Shared by single-file and batch mode.
#[derive(Clone)]
pub struct JobRunner {
    emulator: EmulatorSettings,
    ini_writer: IniSettingsWriter,
    encoder: EncodeInvoker,
    base_user_dir: PathBuf,
    working_dir: PathBuf,
    remove_short: bool,
    registry: WorkspaceRegistry,
    metadata: Arc<dyn ReplayMetadata>,
    timings: SupervisorTimings,
}

impl JobRunner {
    pub fn new(cfg: &RenderConfig, registry: WorkspaceRegistry) -> Self {
        Self {
            emulator: EmulatorSettings::from_config(cfg),
            ini_writer: IniSettingsWriter::new(RenderSettings::from_config(cfg)),
            encoder: EncodeInvoker::new(&cfg.ffmpeg),
            base_user_dir: cfg.user_dir.clone(),
            working_dir: cfg.working_dir.clone(),
            remove_short: cfg.remove_short,
            registry,
            metadata: Arc::new(SlippiMetadataReader),
            timings: SupervisorTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn ReplayMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn encoder(&self) -> &EncodeInvoker {
        &self.encoder
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Build a job for `input`, reading its frame count
    pub fn prepare(&self, input: &Path, output: &Path) -> RenderResult<Job> {
        let frames = self.metadata.frame_count(input)?;
        Ok(Job::new(input.to_path_buf(), output.to_path_buf(), frames))
    }

    /// Run `job` to completion, updating its status.
    /// Short games are skipped before any workspace is created.
    pub async fn execute(&self, job: &mut Job) -> RenderResult<JobStatus> {
        if is_game_too_short(job.expected_frame_count, self.remove_short) {
            info!(
                "Job {}: skipping {} ({} frames, game too short)",
                job.id,
                job.input_path.display(),
                job.expected_frame_count
            );
            job.mark_skipped("game too short");
            return Ok(job.status);
        }

        info!(
            "Job {}: rendering {} -> {} ({} frames)",
            job.id,
            job.input_path.display(),
            job.output_path.display(),
            job.expected_frame_count
        );
        job.mark_running();

        match self.render(job).await {
            Ok(()) => {
                job.mark_success();
                info!("Job {}: complete: {}", job.id, job.output_path.display());
                Ok(job.status)
            }
            Err(e) => {
                error!("Job {}: failed: {}", job.id, e);
                job.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn render(&self, job: &Job) -> RenderResult<()> {
        let workspace = WorkspaceGuard::acquire_async(
            self.base_user_dir.clone(),
            self.working_dir.clone(),
            job.id.clone(),
            self.registry.clone(),
        )
        .await?;

        let result = self.render_in(&workspace, job).await;
        // A cancelled job still releases through the guard's drop
        workspace.release_async().await;
        result
    }

    async fn render_in(&self, workspace: &Workspace, job: &Job) -> RenderResult<()> {
        let mut supervisor = RenderSupervisor::new(
            workspace,
            control_file_path(&self.working_dir, &job.id),
            self.emulator.clone(),
            self.ini_writer.clone(),
        )
        .with_timings(self.timings);
        let artifacts = supervisor.run(&job.input_path, job.expected_frame_count).await?;

        if let Some(parent) = job.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| RenderError::io(parent, e))?;
            }
        }

        self.encoder
            .run(&artifacts.video_path, &artifacts.audio_path, &job.output_path)
            .await?;
        Ok(())
    }
}
