use std::process::ExitStatus;
use std::time::Duration;
use log::{debug, warn};
use tokio::process::Child;
use crate::error::{RenderError, RenderResult};

/// How an emulator process ended up stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before we asked
    AlreadyExited(ExitStatus),
    /// Exited within the grace period after the stop request
    Graceful(ExitStatus),
    /// Ignored the stop request and was force-killed
    Killed,
}

/// Ask the process to stop, wait up to `grace`, then force-kill it
pub async fn terminate(child: &mut Child, grace: Duration) -> RenderResult<Termination> {
    if let Some(status) = child
        .try_wait()
        .map_err(|e| RenderError::Process(format!("failed to poll process: {}", e)))?
    {
        debug!("Process already exited with {}", status);
        return Ok(Termination::AlreadyExited(status));
    }

    request_stop(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Process stopped with {}", status);
            Ok(Termination::Graceful(status))
        }
        Ok(Err(e)) => Err(RenderError::Process(format!("failed to wait for process: {}", e))),
        Err(_) => {
            warn!("Timed out after {:?} waiting for process to terminate, killing it", grace);
            child
                .kill()
                .await
                .map_err(|e| RenderError::Process(format!("failed to kill process: {}", e)))?;
            Ok(Termination::Killed)
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // No pid means tokio has already reaped it
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("SIGTERM to pid {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop process: {}", e);
    }
}
