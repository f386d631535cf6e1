pub mod batch;
pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod ini;
pub mod job;
pub mod process;
pub mod progress;
pub mod replay;
pub mod runner;
pub mod supervisor;
pub mod workspace;

pub use batch::{BatchCoordinator, BatchSummary};
pub use config::{Parallelism, RenderConfig};
pub use encode::EncodeInvoker;
pub use error::{EncodeError, RenderError, RenderResult};
pub use ini::IniSettingsWriter;
pub use job::{Job, JobStatus};
pub use runner::JobRunner;
pub use supervisor::{PollOutcome, RecoveredArtifacts, RenderSupervisor, SupervisorTimings};
pub use workspace::{Workspace, WorkspaceGuard, WorkspaceRegistry};
