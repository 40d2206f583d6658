//! Worker processes: one isolated child per device.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin};

use crate::config::CoordinatorAddr;
use crate::device::Device;

/// Hidden subcommand running one worker bound to a single device.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// A started worker, as seen by the pool.
#[async_trait]
pub trait WorkerHandle: Send {
    fn device(&self) -> &Device;

    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Ask the worker to close its connection and exit, then force it once
    /// `grace` has elapsed.
    async fn terminate(&mut self, grace: Duration);
}

pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        device: &Device,
        coordinator: &CoordinatorAddr,
    ) -> Result<Box<dyn WorkerHandle>>;
}

/// Re-executes `program` with the worker subcommand for each device.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        device: &Device,
        coordinator: &CoordinatorAddr,
    ) -> Result<Box<dyn WorkerHandle>> {
        let child = tokio::process::Command::new(&self.program)
            .arg(WORKER_SUBCOMMAND)
            .arg("--platform")
            .arg(device.platform_index.to_string())
            .arg("--device")
            .arg(device.device_index.to_string())
            .arg("--supervised")
            .arg(&coordinator.host)
            .arg(coordinator.port.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker for {}", device.name))?;

        tracing::debug!(pid = ?child.id(), device = %device.name, "Worker process spawned");
        Ok(Box::new(WorkerProcess::new(device.clone(), child)))
    }
}

pub struct WorkerProcess {
    device: Device,
    child: Child,
    /// Held open for the worker's lifetime; closing it requests exit.
    stdin: Option<ChildStdin>,
}

impl WorkerProcess {
    pub fn new(device: Device, mut child: Child) -> Self {
        let stdin = child.stdin.take();
        Self { device, child, stdin }
    }
}

#[async_trait]
impl WorkerHandle for WorkerProcess {
    fn device(&self) -> &Device {
        &self.device
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(device = %self.device.name, %status, "Worker process exited");
                false
            }
            Err(e) => {
                tracing::warn!(device = %self.device.name, "Failed to poll worker process: {e}");
                false
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        drop(self.stdin.take());
        let device = &self.device.name;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%device, %status, "Worker stopped"),
            Ok(Err(e)) => tracing::warn!(%device, "Failed to wait for worker: {e}"),
            Err(_) => {
                tracing::warn!(%device, "Worker ignored shutdown, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(%device, "Failed to kill worker: {e}");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::device::test_device;

    fn spawn(script: &str) -> WorkerProcess {
        let child = tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        WorkerProcess::new(test_device(0, 0), child)
    }

    #[tokio::test]
    async fn test_closing_stdin_stops_cooperative_worker() {
        let mut worker = spawn("cat > /dev/null");
        assert!(worker.is_alive());

        let started = std::time::Instant::now();
        worker.terminate(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_killed_after_grace() {
        let mut worker = spawn("trap '' HUP; sleep 30");
        worker.terminate(Duration::from_millis(100)).await;
        assert!(!worker.is_alive());
    }
}
