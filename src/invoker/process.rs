use super::{ToolInvocation, ToolOutput, ToolRunner};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Production runner backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> JobResult<ToolOutput> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        debug!("Running: {}", invocation.display());
        let started = Instant::now();

        let child = Command::new(&invocation.executable)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::ToolLaunchError {
                executable: invocation.executable.clone(),
                reason: e.to_string(),
            })?;

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            result = child.wait_with_output() => result.map_err(|e| JobError::ToolLaunchError {
                executable: invocation.executable.clone(),
                reason: format!("failed to collect output: {}", e),
            })?,
            _ = tokio::time::sleep(invocation.timeout) => {
                warn!(
                    "{} timed out after {:?}, killing process",
                    invocation.executable, invocation.timeout
                );
                return Err(JobError::ToolTimeout {
                    executable: invocation.executable.clone(),
                    timeout_ms: invocation.timeout.as_millis() as u64,
                });
            }
            _ = cancel.cancelled() => {
                debug!("{} cancelled, killing process", invocation.executable);
                return Err(JobError::Cancelled);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // Killed by a signal: no exit code
        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            return Err(JobError::tool_failed(exit_code, &stderr));
        }

        debug!("{} finished in {} ms", invocation.executable, duration_ms);
        Ok(ToolOutput {
            exit_code,
            stdout,
            stderr,
            duration_ms,
        })
    }
}
