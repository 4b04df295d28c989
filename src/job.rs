//! # Job Module
//!
//! Value object e record mutabile di un job.
//!
//! ## Responsabilità:
//! - `JobId` / `UserId`: identificatori tipizzati
//! - `JobState`: macchina a stati con transizioni ammesse
//! - `JobRequest`: richiesta immutabile, validata alla costruzione
//! - `Job`: record posseduto dal motore (stato, progresso, output, errore)
//! - `JobStatus`: snapshot restituito al chiamante

use crate::error::{JobError, JobResult};
use crate::utils::require_utf8;
use crate::operation::{Operation, OperationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique job identifier (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Directory name of this job's workspace
    pub fn workspace_dir_name(&self) -> String {
        format!("job-{}", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|e| JobError::InvalidParameters(format!("invalid job id '{}': {}", s, e)))
    }
}

/// Opaque identifier of the submitting user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    /// Allowed edges of the job state machine.
    ///
    /// `Queued -> Failed` only happens when admission breaks before the job runs.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Immutable request; construct with [`JobRequest::new`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    job_id: JobId,
    user_id: UserId,
    kind: OperationKind,
    inputs: Vec<PathBuf>,
    parameters: BTreeMap<String, String>,
    operation: Operation,
    notices: Vec<String>,
    input_bytes: u64,
    submitted_at: DateTime<Utc>,
    sequence: u64,
}

impl JobRequest {
    /// Validate parameters and build a request.
    ///
    /// Only checks the parameters themselves; inputs are inspected on admission.
    pub fn new(
        user_id: UserId,
        kind: OperationKind,
        inputs: Vec<PathBuf>,
        parameters: BTreeMap<String, String>,
    ) -> JobResult<Self> {
        for input in &inputs {
            require_utf8(input)?;
        }
        let validated = Operation::parse(kind, &parameters, inputs.len())?;
        Ok(Self {
            job_id: JobId::new(),
            user_id,
            kind,
            inputs,
            parameters,
            operation: validated.operation,
            notices: validated.notices,
            input_bytes: 0,
            submitted_at: Utc::now(),
            sequence: 0,
        })
    }

    /// Stamp admission data measured by the engine
    pub(crate) fn admitted(mut self, input_bytes: u64, sequence: u64) -> Self {
        self.input_bytes = input_bytes;
        self.sequence = sequence;
        self.submitted_at = Utc::now();
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn input_bytes(&self) -> u64 {
        self.input_bytes
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

/// Mutable job record owned by the engine
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub request: JobRequest,
    pub state: JobState,
    pub progress: u8,
    /// Set while Running and kept on Succeeded/Failed as the reclaimed path.
    /// Cancelled jobs and jobs that failed before admission have none.
    pub workspace: Option<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub error: Option<JobError>,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub delivery_error: Option<String>,
    pub history: Vec<Transition>,
    #[serde(skip)]
    pub(crate) published: bool,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            state: JobState::Queued,
            progress: 0,
            workspace: None,
            outputs: Vec::new(),
            error: None,
            attempt: 0,
            started_at: None,
            finished_at: None,
            delivery_error: None,
            history: Vec::new(),
            published: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.request.job_id()
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Apply a progress report.
    ///
    /// Values are clamped to 100. Returns `false` when the report was ignored
    /// (job not running, or the value would move progress backwards).
    pub fn record_progress(&mut self, percent: u8) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        let percent = percent.min(100);
        if percent < self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    /// Move to `to`, checking both the expected current state and the state machine
    pub fn transition(&mut self, from: JobState, to: JobState) -> JobResult<Transition> {
        if self.state != from {
            return Err(JobError::InternalInconsistency(format!(
                "job {} is {} but transition expected {}",
                self.id(),
                self.state,
                from
            )));
        }
        if !from.can_transition_to(to) {
            return Err(JobError::InternalInconsistency(format!(
                "job {}: illegal transition {} -> {}",
                self.id(),
                from,
                to
            )));
        }

        let now = Utc::now();
        self.state = to;
        match to {
            JobState::Running => self.started_at = Some(now),
            JobState::Succeeded => {
                self.progress = 100;
                self.finished_at = Some(now);
            }
            _ if to.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }

        let transition = Transition { from, to, at: now };
        self.history.push(transition.clone());
        Ok(transition)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id(),
            state: self.state,
            progress: self.progress,
            outputs: self.outputs.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
            delivery_error: self.delivery_error.clone(),
            notices: self.request.notices().to_vec(),
        }
    }
}

/// Snapshot returned by status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub progress: u8,
    pub outputs: Vec<PathBuf>,
    pub error: Option<String>,
    pub delivery_error: Option<String>,
    pub notices: Vec<String>,
}
