//! # Result Publisher Module
//!
//! Consegna il risultato di ogni job terminato esattamente una volta e poi
//! rilascia il workspace, qualunque sia l'esito della consegna.
//!
//! ## Responsabilità:
//! - Costruisce il `JobNotice` dallo stato finale del job
//! - Consegna tramite il `ResultSink` del chiamante
//! - Registra l'eventuale errore di consegna sul job
//! - Scrive una riga nel log di audit (se configurato)
//! - Rilascia il workspace

use crate::audit::AuditLog;
use crate::error::{JobError, JobResult};
use crate::file_manager::FileManager;
use crate::job::{Job, JobId, JobState, UserId};
use crate::operation::OperationKind;
use crate::tracker::Tracker;
use crate::workspace::WorkspaceManager;
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Terminal result pushed to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobNotice {
    pub job_id: JobId,
    pub user_id: UserId,
    pub kind: OperationKind,
    pub state: JobState,
    pub outputs: Vec<PathBuf>,
    pub error: Option<String>,
    pub notices: Vec<String>,
}

impl From<&Job> for JobNotice {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            user_id: job.request.user_id().clone(),
            kind: job.request.kind(),
            state: job.state,
            outputs: job.outputs.clone(),
            error: job.error.as_ref().map(|e| e.to_string()),
            notices: job.request.notices().to_vec(),
        }
    }
}

/// Receives terminal job results.
///
/// Output paths point into the job's workspace and are only valid until
/// `deliver` returns: the workspace is deleted right after.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, notice: &JobNotice) -> anyhow::Result<()>;
}

/// Forwards notices over a channel; outputs are gone once received
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<JobNotice>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn deliver(&self, notice: &JobNotice) -> anyhow::Result<()> {
        self.sender
            .send(notice.clone())
            .map_err(|_| anyhow::anyhow!("result receiver dropped"))
    }
}

/// Copies outputs of succeeded jobs into `<dir>/<job_id>/`, then forwards the notice
pub struct DirectorySink {
    dir: PathBuf,
    next: Option<Arc<dyn ResultSink>>,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next: None,
        }
    }

    /// Forward every notice, with outputs rewritten to the copies
    pub fn forward_to(mut self, next: Arc<dyn ResultSink>) -> Self {
        self.next = Some(next);
        self
    }
}

#[async_trait]
impl ResultSink for DirectorySink {
    async fn deliver(&self, notice: &JobNotice) -> anyhow::Result<()> {
        let mut copied = Vec::with_capacity(notice.outputs.len());

        if notice.state == JobState::Succeeded && !notice.outputs.is_empty() {
            let target = self.dir.join(notice.job_id.to_string());
            tokio::fs::create_dir_all(&target)
                .await
                .with_context(|| format!("cannot create {}", target.display()))?;

            for output in &notice.outputs {
                let name = output
                    .file_name()
                    .ok_or_else(|| anyhow::anyhow!("output {} has no file name", output.display()))?;
                let destination = target.join(name);
                let bytes = tokio::fs::copy(output, &destination)
                    .await
                    .with_context(|| format!("cannot copy {}", output.display()))?;
                debug!("Copied {} ({})", destination.display(), FileManager::format_size(bytes));
                copied.push(destination);
            }
        }

        match &self.next {
            Some(next) => {
                let forwarded = JobNotice {
                    outputs: copied,
                    ..notice.clone()
                };
                next.deliver(&forwarded).await
            }
            None => Ok(()),
        }
    }
}

pub struct Publisher {
    tracker: Arc<Tracker>,
    workspaces: Arc<WorkspaceManager>,
    sink: Arc<dyn ResultSink>,
    audit: Option<AuditLog>,
}

impl Publisher {
    pub fn new(
        tracker: Arc<Tracker>,
        workspaces: Arc<WorkspaceManager>,
        sink: Arc<dyn ResultSink>,
        audit: Option<AuditLog>,
    ) -> Self {
        Self {
            tracker,
            workspaces,
            sink,
            audit,
        }
    }

    /// Deliver a terminal job once, then release its workspace.
    ///
    /// Repeated or premature calls are logged and have no effect.
    pub async fn publish(&self, job_id: JobId) {
        let claimed = self.tracker.update(job_id, claim).await.and_then(|claimed| claimed);
        let notice = match claimed {
            Ok(notice) => notice,
            Err(e) => {
                error!("Not publishing job {}: {}", job_id, e);
                return;
            }
        };

        if let Err(e) = self.sink.deliver(&notice).await {
            warn!("Delivery of job {} failed: {:#}", job_id, e);
            let reason = format!("{:#}", e);
            if let Err(e) = self
                .tracker
                .update(job_id, |job| job.delivery_error = Some(reason))
                .await
            {
                error!("{}", e);
            }
        }

        if let Some(audit) = &self.audit {
            if let Some(job) = self.tracker.get(job_id).await {
                if let Err(e) = audit.record(&job).await {
                    warn!("Audit record for job {} failed: {:#}", job_id, e);
                }
            }
        }

        self.workspaces.release(job_id).await;
        debug!("Job {} published", job_id);
    }
}

/// Mark the job published and build its notice
fn claim(job: &mut Job) -> JobResult<JobNotice> {
    if !job.state.is_terminal() {
        return Err(JobError::InternalInconsistency(format!(
            "job {} is still {}",
            job.id(),
            job.state
        )));
    }
    if job.published {
        return Err(JobError::InternalInconsistency(format!(
            "job {} was already published",
            job.id()
        )));
    }
    job.published = true;
    Ok(JobNotice::from(&*job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn deliver(&self, _notice: &JobNotice) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("caller went away"))
        }
    }

    async fn running_job(tracker: &Tracker, workspaces: &WorkspaceManager) -> (JobId, PathBuf) {
        let request = JobRequest::new(
            UserId::from("u"),
            OperationKind::Thumbnail,
            vec![PathBuf::from("clip.mp4")],
            BTreeMap::new(),
        )
        .unwrap();
        let job = Job::new(request);
        let id = job.id();
        tracker.insert(job).await.unwrap();
        let workspace = workspaces.acquire(id, 10).await.unwrap();
        tracker.on_transition(id, JobState::Queued, JobState::Running).await.unwrap();
        (id, workspace)
    }

    #[tokio::test]
    async fn test_publish_exactly_once_then_release() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(Tracker::new());
        let workspaces = Arc::new(WorkspaceManager::new(dir.path().join("ws"), 1000, 4));
        let (sink, mut notices) = ChannelSink::new();
        let publisher = Publisher::new(tracker.clone(), workspaces.clone(), Arc::new(sink), None);

        let (id, workspace) = running_job(&tracker, &workspaces).await;

        publisher.publish(id).await;
        assert!(notices.try_recv().is_err());
        assert!(workspace.exists());

        tracker.on_transition(id, JobState::Running, JobState::Succeeded).await.unwrap();
        publisher.publish(id).await;
        publisher.publish(id).await;

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.job_id, id);
        assert_eq!(notice.state, JobState::Succeeded);
        assert!(notices.try_recv().is_err());
        assert!(!workspace.exists());
        assert_eq!(workspaces.release_count(id).await, 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(Tracker::new());
        let workspaces = Arc::new(WorkspaceManager::new(dir.path().join("ws"), 1000, 4));
        let audit = AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap();
        let publisher = Publisher::new(tracker.clone(), workspaces.clone(), Arc::new(FailingSink), Some(audit));

        let (id, workspace) = running_job(&tracker, &workspaces).await;
        tracker.on_transition(id, JobState::Running, JobState::Failed).await.unwrap();
        publisher.publish(id).await;

        let job = tracker.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.delivery_error.unwrap().contains("caller went away"));
        assert!(!workspace.exists());

        let records = AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap().read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].delivery_error.is_some());
    }

    #[tokio::test]
    async fn test_directory_sink_copies_outputs() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("thumbnail.jpg");
        std::fs::write(&output, b"jpeg").unwrap();

        let (channel, mut notices) = ChannelSink::new();
        let sink = DirectorySink::new(dir.path().join("out")).forward_to(Arc::new(channel));
        let notice = JobNotice {
            job_id: JobId::new(),
            user_id: UserId::from("u"),
            kind: OperationKind::Thumbnail,
            state: JobState::Succeeded,
            outputs: vec![output],
            error: None,
            notices: vec![],
        };
        sink.deliver(&notice).await.unwrap();

        let forwarded = notices.recv().await.unwrap();
        let expected = dir.path().join("out").join(notice.job_id.to_string()).join("thumbnail.jpg");
        assert_eq!(forwarded.outputs, vec![expected.clone()]);
        assert_eq!(std::fs::read(expected).unwrap(), b"jpeg");
    }
}
