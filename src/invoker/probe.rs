use super::{ToolInvocation, ToolRunner};
use crate::args;
use crate::error::{JobError, JobResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// ffprobe query printing only the container duration in seconds
pub fn probe_invocation(ffprobe: &str, input: &Path, working_dir: &Path, timeout: Duration) -> ToolInvocation {
    ToolInvocation::new(
        ffprobe,
        args![
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
            input.display()
        ],
        working_dir,
    )
    .with_timeout(timeout)
}

/// Extract a positive duration from ffprobe stdout
pub fn parse_probe_output(stdout: &str) -> JobResult<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| {
            JobError::tool_failed(0, &format!("ffprobe reported no usable duration: '{}'", stdout.trim()))
        })
}

/// Per-job duration cache, kept across retries
#[derive(Debug, Default)]
pub struct ProbeCache {
    durations: Mutex<HashMap<PathBuf, f64>>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of `input` in seconds, probing only on the first call
    pub async fn duration(
        &self,
        runner: &dyn ToolRunner,
        invocation: &ToolInvocation,
        input: &Path,
        cancel: &CancellationToken,
    ) -> JobResult<f64> {
        if let Some(cached) = self.durations.lock().await.get(input) {
            debug!("Using cached duration for {}", input.display());
            return Ok(*cached);
        }

        let output = runner.run(invocation, cancel).await?;
        let duration = parse_probe_output(&output.stdout)?;
        debug!("Probed {}: {:.3}s", input.display(), duration);
        self.durations.lock().await.insert(input.to_path_buf(), duration);
        Ok(duration)
    }
}
