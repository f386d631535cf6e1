use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;
use crate::encode::write_concat_manifest;
use crate::error::{RenderError, RenderResult};
use crate::job::{new_job_id, Job, JobStatus};
use crate::runner::JobRunner;

/// Replay file extension
const REPLAY_EXTENSION: &str = "slp";

/// Replays sharing one parent directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySet {
    /// Parent directory relative to the input root; empty for the root itself
    pub rel_dir: PathBuf,
    /// Sorted by file name
    pub inputs: Vec<PathBuf>,
}

/// Totals for a batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub rendered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub combined: usize,
}

/// Find every replay under `in_root`, grouped by parent directory
pub fn discover_sets(in_root: &Path) -> Vec<ReplaySet> {
    let mut sets: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(in_root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_replay(path) {
            continue;
        }

        let rel_dir = path
            .parent()
            .and_then(|p| p.strip_prefix(in_root).ok())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!("Found replay: {}", path.display());
        sets.entry(rel_dir).or_default().push(path.to_path_buf());
    }

    sets.into_iter()
        .map(|(rel_dir, mut inputs)| {
            inputs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            ReplaySet { rel_dir, inputs }
        })
        .collect()
}

fn is_replay(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(REPLAY_EXTENSION))
        .unwrap_or(false)
}

/// `<out_root>/<rel_dir>/<stem>.mp4`
pub fn output_path_for(out_root: &Path, rel_dir: &Path, input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    out_root.join(rel_dir).join(format!("{}.mp4", stem))
}

/// `<out_root>/<rel_dir>.mp4`, or `<out_root>/<input root name>.mp4` for the root set
pub fn combined_output_for(in_root: &Path, out_root: &Path, rel_dir: &Path) -> PathBuf {
    let name = match rel_dir.file_name() {
        Some(name) => name.to_string_lossy().to_string(),
        None => root_name(in_root),
    };
    let parent = rel_dir.parent().unwrap_or_else(|| Path::new(""));
    out_root.join(parent).join(format!("{}.mp4", name))
}

fn root_name(in_root: &Path) -> String {
    fs::canonicalize(in_root)
        .ok()
        .as_deref()
        .unwrap_or(in_root)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "replays".to_string())
}

/// A set and where its videos end up
struct PlannedSet {
    set: ReplaySet,
    outputs: Vec<PathBuf>,
    combined_output: PathBuf,
    combine: bool,
}

/// Renders a directory tree of replays on a bounded pool
pub struct BatchCoordinator {
    runner: Arc<JobRunner>,
    workers: usize,
    combine: bool,
}

impl BatchCoordinator {
    pub fn new(runner: JobRunner, workers: usize, combine: bool) -> Self {
        Self {
            runner: Arc::new(runner),
            workers: workers.max(1),
            combine,
        }
    }

    /// Render every replay under `in_root` whose output is not already there.
    /// Individual job failures are counted, never returned.
    pub async fn run(&self, in_root: &Path, out_root: &Path) -> RenderResult<BatchSummary> {
        if !in_root.is_dir() {
            return Err(RenderError::Setup(format!(
                "input directory does not exist: {}",
                in_root.display()
            )));
        }

        let sets = {
            let in_root = in_root.to_path_buf();
            tokio::task::spawn_blocking(move || discover_sets(&in_root))
                .await
                .map_err(|e| RenderError::Setup(format!("replay discovery failed: {}", e)))?
        };
        let total: usize = sets.iter().map(|s| s.inputs.len()).sum();
        info!(
            "Found {} replays in {} directories under {}, rendering with {} workers",
            total,
            sets.len(),
            in_root.display(),
            self.workers
        );

        // A combined video must never overwrite or stand in for a single game's video
        let individual_outputs: HashSet<PathBuf> = sets
            .iter()
            .flat_map(|set| set.inputs.iter().map(|input| output_path_for(out_root, &set.rel_dir, input)))
            .collect();

        let mut summary = BatchSummary::default();
        let mut planned = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for set in sets {
            let combined_output = combined_output_for(in_root, out_root, &set.rel_dir);
            let combine = self.combine && !individual_outputs.contains(&combined_output);
            if self.combine && !combine {
                warn!(
                    "Not combining {}: {} is also the output of a single replay",
                    set.rel_dir.display(),
                    combined_output.display()
                );
            }
            if combine && combined_output.exists() {
                info!(
                    "Skipping {} replays in {}: combined output exists",
                    set.inputs.len(),
                    combined_output.display()
                );
                summary.skipped += set.inputs.len();
                continue;
            }

            let mut outputs = Vec::with_capacity(set.inputs.len());
            for input in &set.inputs {
                let output = output_path_for(out_root, &set.rel_dir, input);
                outputs.push(output.clone());

                if output.exists() {
                    debug!("Skipping {}: output exists", input.display());
                    summary.skipped += 1;
                    continue;
                }

                let mut job = match self.prepare_job(input, &output).await {
                    Ok(job) => job,
                    Err(e) => {
                        error!("Skipping {}: {}", input.display(), e);
                        summary.failed += 1;
                        continue;
                    }
                };

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| RenderError::Process(format!("worker pool closed: {}", e)))?;
                let runner = self.runner.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    runner.execute(&mut job).await.unwrap_or(JobStatus::Failed)
                });
            }

            planned.push(PlannedSet {
                set,
                outputs,
                combined_output,
                combine,
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(JobStatus::Success) => summary.rendered += 1,
                Ok(JobStatus::Skipped) => summary.skipped += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    error!("Render task aborted: {}", e);
                    summary.failed += 1;
                }
            }
        }

        if self.combine {
            for plan in planned.iter().filter(|plan| plan.combine) {
                if self.combine_set(plan).await {
                    summary.combined += 1;
                }
            }
        }

        info!(
            "Batch complete: {} rendered, {} skipped, {} failed, {} combined",
            summary.rendered, summary.skipped, summary.failed, summary.combined
        );
        Ok(summary)
    }

    /// Read the replay's frame count off the async workers; a bad replay fails only itself
    async fn prepare_job(&self, input: &Path, output: &Path) -> RenderResult<Job> {
        let runner = self.runner.clone();
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        tokio::task::spawn_blocking(move || runner.prepare(&input, &output))
            .await
            .map_err(|e| RenderError::Process(format!("replay read task failed: {}", e)))?
    }

    /// Concatenate a set's outputs and delete the pieces; false when nothing was combined
    async fn combine_set(&self, plan: &PlannedSet) -> bool {
        let present: Vec<PathBuf> = plan.outputs.iter().filter(|p| p.is_file()).cloned().collect();
        if present.is_empty() {
            debug!("Nothing to combine for {}", plan.set.rel_dir.display());
            return false;
        }

        let working_dir = self.runner.working_dir();
        if let Err(e) = fs::create_dir_all(working_dir) {
            error!("Failed to create {}: {}", working_dir.display(), e);
            return false;
        }
        let manifest = working_dir.join(format!("concat-{}.txt", new_job_id()));

        let result = match write_concat_manifest(&manifest, &present) {
            Ok(()) => self.runner.encoder().combine(&manifest, &plan.combined_output).await,
            Err(e) => Err(e),
        };
        if let Err(e) = fs::remove_file(&manifest) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove concat manifest {}: {}", manifest.display(), e);
            }
        }

        match result {
            Ok(_) => {
                for piece in &present {
                    if let Err(e) = fs::remove_file(piece) {
                        warn!("Failed to remove {}: {}", piece.display(), e);
                    }
                }
                info!("Combined {} videos into {}", present.len(), plan.combined_output.display());
                true
            }
            Err(e) => {
                error!("Failed to combine {}: {}", plan.combined_output.display(), e);
                false
            }
        }
    }
}
