//! Starting hide workers.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use veil_common::{VeilError, VeilResult};

use super::protocol::{WorkerReport, WorkerRequest};

/// Runs a hide worker to completion.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Run a worker for `request` and return its report.
    ///
    /// An error means the worker could not be started or died without
    /// reporting; the target may still be suspended.
    async fn run(&self, request: WorkerRequest) -> VeilResult<WorkerReport>;
}

/// [`WorkerLauncher`] that re-executes a binary with the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    proc_root: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Launch workers from `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            proc_root: None,
        }
    }

    /// Launch workers from the running executable.
    pub fn current_exe() -> VeilResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Point workers at a custom procfs root.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = Some(root.into());
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn run(&self, request: WorkerRequest) -> VeilResult<WorkerReport> {
        let pid = request.target_pid;
        let worker_err = |message: String| VeilError::Worker { pid, message };

        let payload = serde_json::to_vec(&request)?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(root) = &self.proc_root {
            command.env("VEIL_PROC_ROOT", root);
        }

        let mut child = command
            .spawn()
            .map_err(|e| worker_err(format!("failed to start {}: {e}", self.program.display())))?;
        tracing::debug!(pid, worker = ?child.id(), "Worker started");

        if let Some(mut stdin) = child.stdin.take() {
            let delivered = async {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await
            };
            delivered
                .await
                .map_err(|e| worker_err(format!("request not delivered: {e}")))?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(worker_err(format!("exited with {}", output.status)));
        }

        let line = output
            .stdout
            .split(|b| *b == b'\n')
            .find(|line| !line.is_empty())
            .ok_or_else(|| worker_err("no report".to_string()))?;
        let report: WorkerReport = serde_json::from_slice(line)?;

        if report.target_pid != pid {
            return Err(worker_err(format!(
                "report is for pid {}",
                report.target_pid
            )));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_worker_error() {
        let launcher = ProcessLauncher::new("/nonexistent/veil-worker");
        let err = launcher.run(WorkerRequest::new(99)).await.unwrap_err();
        assert!(matches!(err, VeilError::Worker { pid: 99, .. }));
    }

    #[tokio::test]
    async fn failing_program_is_a_worker_error() {
        let launcher = ProcessLauncher::new("false");
        let err = launcher.run(WorkerRequest::new(5)).await.unwrap_err();
        assert!(matches!(err, VeilError::Worker { pid: 5, .. }));
    }
}
