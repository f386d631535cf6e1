use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a render job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// One replay to render into one video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique per render across the whole process; names the workspace and control file
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub expected_frame_count: i64,
    pub status: JobStatus,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(input_path: PathBuf, output_path: PathBuf, expected_frame_count: i64) -> Self {
        Self {
            id: new_job_id(),
            input_path,
            output_path,
            expected_frame_count,
            status: JobStatus::Pending,
            reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_success(&mut self) {
        self.status = JobStatus::Success;
        self.reason = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Skipped;
        self.reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}

/// Fresh identifier for a job
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh `commandId` for a control file; never reused between emulator launches
pub fn new_command_id() -> String {
    Uuid::new_v4().simple().to_string()
}
