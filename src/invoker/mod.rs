//! # Tool Invoker Module
//!
//! Questo modulo esegue i tool esterni e mappa le operazioni sulle loro invocazioni.
//!
//! ## Responsabilità:
//! - `ToolInvocation` / `ToolOutput`: descrizione e risultato di un singolo processo
//! - `ToolRunner`: trait iniettabile (produzione: `ProcessRunner`, test: fake)
//! - `plan`: mappatura pura operazione → manifest + passi + output attesi
//! - `probe`: query della durata con ffprobe e cache per job
//!
//! ## Garanzie:
//! - Un solo processo figlio per invocazione, nessuna shell
//! - stdout/stderr catturati, mai mescolati con i log del motore
//! - Timeout e cancellazione uccidono il processo in volo

pub mod plan;
pub mod probe;
pub mod process;

pub use plan::{plan, ExecutionPlan, ExpectedOutputs, Manifest, PlanContext};
pub use probe::{parse_probe_output, probe_invocation, ProbeCache};
pub use process::ProcessRunner;

use crate::error::JobResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One external process to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub executable: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: PathBuf,
}

impl ToolInvocation {
    pub fn new(executable: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args,
            timeout: Duration::from_secs(600),
            working_dir: working_dir.into(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line for debug logging
    pub fn display(&self) -> String {
        format!("{} {}", self.executable, self.args.join(" "))
    }
}

/// Captured result of a successful invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs tool invocations.
///
/// Errors: `ToolLaunchError` when the executable can't be started, `ToolTimeout`
/// when `invocation.timeout` elapses, `ToolFailed` on a non-zero exit and
/// `Cancelled` when `cancel` fires. The process is killed in the last two cases.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> JobResult<ToolOutput>;
}
