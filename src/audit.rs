//! JSON-lines audit log of finished jobs.

use crate::job::{Job, JobId, JobState, UserId};
use crate::operation::OperationKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub user_id: UserId,
    pub kind: OperationKind,
    pub state: JobState,
    pub attempts: u32,
    pub input_bytes: u64,
    pub outputs: usize,
    pub error: Option<String>,
    pub delivery_error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for AuditRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            user_id: job.request.user_id().clone(),
            kind: job.request.kind(),
            state: job.state,
            attempts: job.attempt,
            input_bytes: job.request.input_bytes(),
            outputs: job.outputs.len(),
            error: job.error.as_ref().map(|e| e.to_string()),
            delivery_error: job.delivery_error.clone(),
            submitted_at: job.request.submitted_at(),
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Open (creating parent directories) the log at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create audit directory {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, job: &Job) -> Result<()> {
        let mut line = serde_json::to_string(&AuditRecord::from(job))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("cannot open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record back
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("malformed audit line"))
            .collect()
    }
}
