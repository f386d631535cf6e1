use std::collections::HashSet;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::error::{RenderError, RenderResult};

/// Private copy of the emulator user directory for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub job_id: String,
    /// Passed to the emulator with `-u`
    pub root: PathBuf,
    /// Progress log; one line per rendered frame
    pub render_time_log: PathBuf,
    pub dump_dir: PathBuf,
    pub frames_dir: PathBuf,
    pub audio_dir: PathBuf,
    /// `framedump0.avi`
    pub video_primary: PathBuf,
    /// `framedump1.avi`, written instead of the primary by some emulator builds
    pub video_secondary: PathBuf,
    pub audio_file: PathBuf,
}

impl Workspace {
    /// Compute the fixed artifact layout under `root` without touching the disk
    pub fn layout(root: PathBuf, job_id: &str) -> Self {
        let dump_dir = root.join("Dump");
        let frames_dir = dump_dir.join("Frames");
        let audio_dir = dump_dir.join("Audio");
        Self {
            job_id: job_id.to_string(),
            render_time_log: root.join("Logs").join("render_time.txt"),
            video_primary: frames_dir.join("framedump0.avi"),
            video_secondary: frames_dir.join("framedump1.avi"),
            audio_file: audio_dir.join("dspdump.wav"),
            dump_dir,
            frames_dir,
            audio_dir,
            root,
        }
    }

    /// Copy `base_dir` into `working_dir/<job_id>`
    pub fn acquire(base_dir: &Path, working_dir: &Path, job_id: &str) -> RenderResult<Self> {
        if !base_dir.is_dir() {
            return Err(RenderError::Setup(format!(
                "base user directory does not exist: {}",
                base_dir.display()
            )));
        }

        // Copying a tree into itself never terminates
        if nests_inside(working_dir, base_dir) {
            return Err(RenderError::Setup(format!(
                "working dir {} is inside the base user directory {}",
                working_dir.display(),
                base_dir.display()
            )));
        }

        let root = working_dir.join(job_id);
        if root.exists() {
            return Err(RenderError::Setup(format!(
                "workspace already exists for job {}: {}",
                job_id,
                root.display()
            )));
        }

        fs::create_dir_all(working_dir).map_err(|e| {
            RenderError::Setup(format!("cannot create working dir {}: {}", working_dir.display(), e))
        })?;

        if let Err(e) = copy_tree(base_dir, &root) {
            // Don't leave a half-copied workspace behind
            let _ = fs::remove_dir_all(&root);
            return Err(e);
        }

        debug!("Job {}: workspace created at {}", job_id, root.display());
        Ok(Self::layout(root, job_id))
    }

    /// Delete the workspace; errors are logged, never returned
    pub fn release(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!("Job {}: workspace removed: {}", self.job_id, self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Job {}: failed to remove workspace {}: {}",
                self.job_id,
                self.root.display(),
                e
            ),
        }
    }
}

/// Whether `inner` is `outer` or lies somewhere below it. Paths that don't
/// exist yet are resolved through their nearest existing ancestor.
pub fn nests_inside(inner: &Path, outer: &Path) -> bool {
    resolve_path(inner).starts_with(resolve_path(outer))
}

fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
            resolve_path(parent).join(name)
        }
        _ => path.to_path_buf(),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> RenderResult<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| RenderError::Setup(format!("failed to read {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RenderError::Setup(e.to_string()))?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| {
                RenderError::Setup(format!("failed to create {}: {}", target.display(), e))
            })?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                RenderError::Setup(format!(
                    "failed to copy {} -> {}: {}",
                    entry.path().display(),
                    target.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

/// Tracks live workspaces so an interrupt can clean up in-flight jobs
#[derive(Debug, Clone, Default)]
pub struct WorkspaceRegistry {
    live: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, root: &Path) {
        self.lock().insert(root.to_path_buf());
    }

    fn unregister(&self, root: &Path) {
        self.lock().remove(root);
    }

    pub fn live(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    /// Remove every registered workspace; returns how many were removed
    pub fn release_all(&self) -> usize {
        let roots: Vec<PathBuf> = self.lock().drain().collect();
        let mut removed = 0;
        for root in roots {
            match fs::remove_dir_all(&root) {
                Ok(()) => {
                    removed += 1;
                    info!("Removed in-flight workspace: {}", root.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove workspace {}: {}", root.display(), e),
            }
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds a workspace for the duration of a job and releases it on drop
#[derive(Debug)]
pub struct WorkspaceGuard {
    workspace: Workspace,
    registry: WorkspaceRegistry,
    released: bool,
}

impl WorkspaceGuard {
    pub fn acquire(
        base_dir: &Path,
        working_dir: &Path,
        job_id: &str,
        registry: &WorkspaceRegistry,
    ) -> RenderResult<Self> {
        let workspace = Workspace::acquire(base_dir, working_dir, job_id)?;
        registry.register(&workspace.root);
        Ok(Self {
            workspace,
            registry: registry.clone(),
            released: false,
        })
    }

    /// [`WorkspaceGuard::acquire`] on the blocking pool; the copy can be large
    pub async fn acquire_async(
        base_dir: PathBuf,
        working_dir: PathBuf,
        job_id: String,
        registry: WorkspaceRegistry,
    ) -> RenderResult<Self> {
        tokio::task::spawn_blocking(move || Self::acquire(&base_dir, &working_dir, &job_id, &registry))
            .await
            .map_err(|e| RenderError::Setup(format!("workspace copy task failed: {}", e)))?
    }

    /// Delete the workspace on the blocking pool instead of in `drop`
    pub async fn release_async(mut self) {
        let workspace = self.workspace.clone();
        match tokio::task::spawn_blocking(move || workspace.release()).await {
            Ok(()) => self.released = true,
            Err(e) => warn!("Job {}: workspace release task failed: {}", self.workspace.job_id, e),
        }
        self.registry.unregister(&self.workspace.root);
    }
}

impl Deref for WorkspaceGuard {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.released {
            self.workspace.release();
        }
        self.registry.unregister(&self.workspace.root);
    }
}
