use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::ports::{PortRole, PortSet};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("companion binary not found at {0}")]
    BinaryNotFound(PathBuf),
    #[error("failed to launch {path}: {source}")]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("launched process has no pid")]
    MissingPid,
    #[error("failed to query process status: {0}")]
    Wait(#[source] std::io::Error),
    #[error("launch task failed: {0}")]
    TaskFailed(String),
}

/// Everything needed to start one companion instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub resources_dir: PathBuf,
    pub ports: PortSet,
}

impl LaunchSpec {
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = PortRole::ALL
            .iter()
            .map(|&role| format!("--{}={}", role.launch_flag(), self.ports.get(role)))
            .collect();
        args.push(format!("--resources-dir={}", self.resources_dir.display()));
        args
    }
}

/// How a companion process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn is_abnormal(&self) -> bool {
        self.code != Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A running companion. Dropping it kills the process.
#[derive(Debug)]
pub struct CompanionProcess {
    child: Child,
    pid: u32,
}

impl CompanionProcess {
    /// Checks the binary and spawns it on the blocking pool.
    pub async fn launch(spec: LaunchSpec) -> Result<Self, ProcessError> {
        tokio::task::spawn_blocking(move || Self::spawn(&spec))
            .await
            .map_err(|e| ProcessError::TaskFailed(e.to_string()))?
    }

    fn spawn(spec: &LaunchSpec) -> Result<Self, ProcessError> {
        if !spec.binary.is_file() {
            return Err(ProcessError::BinaryNotFound(spec.binary.clone()));
        }

        let mut cmd = Command::new(&spec.binary);
        cmd.args(spec.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);

        let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            path: spec.binary.clone(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::MissingPid)?;

        tracing::info!(
            "Launched companion {} (pid {}) with ports {}",
            display_name(&spec.binary),
            pid,
            spec.ports
        );
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> Result<Option<ExitOutcome>, ProcessError> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitOutcome::from))
            .map_err(ProcessError::Wait)
    }

    /// Asks the process to exit, then force-kills it from a background task
    /// once `grace` has passed. Returns `None` if it had already exited.
    pub fn terminate(mut self, grace: Duration) -> Option<JoinHandle<()>> {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!("Companion (pid {}) already exited: {}", self.pid, status);
            return None;
        }

        tracing::info!("Terminating companion (pid {})", self.pid);
        self.request_exit();

        let Self { mut child, pid } = self;
        Some(tokio::spawn(async move {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => tracing::info!("Companion (pid {}) exited: {}", pid, status),
                Ok(Err(e)) => tracing::warn!("Failed waiting for companion (pid {}): {}", pid, e),
                Err(_) => {
                    tracing::warn!(
                        "Companion (pid {}) still alive after {:?}, killing",
                        pid,
                        grace
                    );
                    if let Err(e) = child.kill().await {
                        tracing::error!("Failed to kill companion (pid {}): {}", pid, e);
                    }
                }
            }
        }))
    }

    #[cfg(unix)]
    fn request_exit(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!("Failed to signal companion (pid {}): {}", self.pid, e),
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!("Failed to stop companion (pid {}): {}", self.pid, e);
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Windows: no console window for the companion.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(_cmd: &mut Command) {}
