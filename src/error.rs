//! # Error Types Module
//!
//! Questo modulo definisce la tassonomia degli errori del motore dei job.
//!
//! ## Responsabilità:
//! - Definisce `JobError` enum per categorizzare ogni fallimento di un job
//! - Traduce errori di processo e filesystem al confine (invoker / workspace)
//! - Distingue errori transitori (ritentabili) da errori permanenti
//! - Fornisce un riassunto leggibile per l'utente finale
//!
//! ## Categorie di errori:
//! - `InvalidParameters`: errore del chiamante, mai ritentato
//! - `ResourceExhausted`: quota disco/workspace superata
//! - `ToolTimeout`: invocazione oltre il timeout, ritentata fino a `max_attempts`
//! - `ToolFailed`: il tool ha girato ed è uscito con codice non zero
//! - `ToolLaunchError`: eseguibile mancante o non eseguibile
//! - `InternalInconsistency`: difetto di programmazione, fatale solo per il job
//! - `Cancelled`: marcatore interno della cancellazione cooperativa
//!
//! ## Esempio:
//! ```ignore
//! if end <= start {
//!     return Err(JobError::InvalidParameters("end must be after start".into()));
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Number of trailing stderr lines kept in error summaries
const STDERR_TAIL_LINES: usize = 12;

/// Failure taxonomy for media jobs
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{executable} timed out after {timeout_ms} ms")]
    ToolTimeout { executable: String, timeout_ms: u64 },

    #[error("Tool exited with code {exit_code}: {stderr}")]
    ToolFailed { exit_code: i32, stderr: String },

    #[error("Failed to launch {executable}: {reason}")]
    ToolLaunchError { executable: String, reason: String },

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Job cancelled")]
    Cancelled,
}

pub type JobResult<T> = std::result::Result<T, JobError>;

impl JobError {
    /// Only timeouts are transient; everything else reflects bad input or environment
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::ToolTimeout { .. })
    }

    /// Errors that operators should look at, not end users
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            JobError::ToolLaunchError { .. } | JobError::InternalInconsistency(_)
        )
    }

    /// Build a `ToolFailed` keeping only the tail of stderr
    pub fn tool_failed(exit_code: i32, stderr: &str) -> Self {
        JobError::ToolFailed {
            exit_code,
            stderr: stderr_tail(stderr),
        }
    }

    /// Translate a filesystem error raised while preparing job storage
    pub fn storage(context: &str, err: std::io::Error) -> Self {
        JobError::ResourceExhausted(format!("{}: {}", context, err))
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
