//! Capture worker processes on top of `tokio::process`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use sensorhub_core::config::CameraConfig;
use sensorhub_core::constants::{WORKER_DEVICE_FLAG, WORKER_LIST_FLAG};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::{HardwareError, Result};
use crate::traits::{WorkerLauncher, WorkerProcess};

/// Launches the capture worker executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Resolve the worker executable from configuration.
    ///
    /// An explicit `worker_path` wins; otherwise the first existing candidate
    /// is used.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::SpawnFailed`] when no executable can be found.
    pub fn from_config(config: &CameraConfig) -> Result<Self> {
        if let Some(path) = &config.worker_path {
            return Ok(Self::new(path));
        }
        config
            .worker_candidates
            .iter()
            .find(|candidate| candidate.exists())
            .map(Self::new)
            .ok_or_else(|| HardwareError::spawn_failed("camera worker executable not found"))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Process = ChildWorker;

    fn launch(&self, device_id: &str) -> Result<Self::Process> {
        let child = Command::new(&self.executable)
            .args([WORKER_DEVICE_FLAG, device_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HardwareError::spawn_failed(format!("{}: {e}", self.executable.display()))
            })?;

        info!(
            device_id = %device_id,
            pid = child.id().unwrap_or_default(),
            "Camera worker started"
        );

        Ok(ChildWorker { child })
    }

    async fn list_devices(&self) -> Result<String> {
        let output = Command::new(&self.executable)
            .arg(WORKER_LIST_FLAG)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                HardwareError::spawn_failed(format!("{}: {e}", self.executable.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HardwareError::invalid_data(format!(
                "worker list failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| HardwareError::invalid_data("worker list output is not UTF-8"))
    }
}

/// A worker running as a child process.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
}

impl WorkerProcess for ChildWorker {
    type Stdout = ChildStdout;
    type Stderr = ChildStderr;

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<Self::Stdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<Self::Stderr> {
        self.child.stderr.take()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        debug!(pid, "Sending SIGTERM to camera worker");
        // SAFETY: pid belongs to a child we have not yet reaped.
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            return Err(HardwareError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}
