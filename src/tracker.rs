//! # Progress/Status Tracker Module
//!
//! Indice condiviso dei job: ogni record ha il proprio mutex dentro una mappa
//! protetta da `RwLock`, così le mutazioni dello stesso job sono serializzate
//! mentre job diversi procedono in parallelo.
//!
//! ## Responsabilità:
//! - Progresso monotono (clamp a 100, regressioni ignorate e loggate)
//! - Transizioni validate, con timestamp e storico
//! - Elenco per utente ordinato per sottomissione decrescente
//! - Eviction dei job terminati oltre il periodo di retention

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState, Transition, UserId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

type JobCell = Arc<Mutex<Job>>;

#[derive(Debug, Default)]
pub struct Tracker {
    jobs: RwLock<HashMap<JobId, JobCell>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        let id = job.id();
        if jobs.contains_key(&id) {
            return Err(JobError::InternalInconsistency(format!("job {} already tracked", id)));
        }
        jobs.insert(id, Arc::new(Mutex::new(job)));
        Ok(())
    }

    async fn cell(&self, job_id: JobId) -> Option<JobCell> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Snapshot of a job
    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        let cell = self.cell(job_id).await?;
        let job = cell.lock().await;
        Some(job.clone())
    }

    /// Apply `f` to the job record under its lock
    pub async fn update<T>(&self, job_id: JobId, f: impl FnOnce(&mut Job) -> T) -> JobResult<T> {
        let cell = self
            .cell(job_id)
            .await
            .ok_or_else(|| JobError::InternalInconsistency(format!("job {} is not tracked", job_id)))?;
        let mut job = cell.lock().await;
        Ok(f(&mut job))
    }

    pub async fn on_progress(&self, job_id: JobId, percent: u8) {
        let applied = self
            .update(job_id, |job| {
                let before = job.progress;
                (job.record_progress(percent), before, job.state)
            })
            .await;

        match applied {
            Ok((true, _, _)) => debug!("Job {} progress {}%", job_id, percent.min(100)),
            Ok((false, before, JobState::Running)) => {
                warn!("Job {} progress regression ignored ({}% -> {}%)", job_id, before, percent)
            }
            Ok((false, _, state)) => debug!("Job {} progress ignored while {}", job_id, state),
            Err(e) => warn!("{}", e),
        }
    }

    /// Validated, timestamped state change
    pub async fn on_transition(&self, job_id: JobId, from: JobState, to: JobState) -> JobResult<Transition> {
        let transition = self.update(job_id, |job| job.transition(from, to)).await??;
        debug!("Job {} {} -> {}", job_id, from, to);
        Ok(transition)
    }

    pub async fn history(&self, job_id: JobId) -> Option<Vec<Transition>> {
        let cell = self.cell(job_id).await?;
        let job = cell.lock().await;
        Some(job.history.clone())
    }

    /// Snapshots of a user's jobs, newest submission first
    pub async fn list_by_user(&self, user_id: &UserId) -> Vec<Job> {
        let cells: Vec<JobCell> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::new();
        for cell in cells {
            let job = cell.lock().await;
            if job.request.user_id() == user_id {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by(|a, b| {
            (b.request.submitted_at(), b.request.sequence()).cmp(&(a.request.submitted_at(), a.request.sequence()))
        });
        jobs
    }

    /// Remove published terminal jobs that finished more than `retention` ago
    pub async fn evict_finished(&self, retention: Duration) -> Vec<JobId> {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = Utc::now() - retention;

        let cells: Vec<(JobId, JobCell)> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(id, cell)| (*id, cell.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, cell) in cells {
            let job = cell.lock().await;
            let finished_long_ago = job.finished_at.map(|at| at <= cutoff).unwrap_or(false);
            if job.state.is_terminal() && job.is_published() && finished_long_ago {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            let mut jobs = self.jobs.write().await;
            for id in &expired {
                jobs.remove(id);
            }
            debug!("Evicted {} finished jobs", expired.len());
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use crate::operation::OperationKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn job_for(user: &str, sequence: u64) -> Job {
        let request = JobRequest::new(
            UserId::from(user),
            OperationKind::Optimize,
            vec![PathBuf::from("clip.mp4")],
            BTreeMap::new(),
        )
        .unwrap()
        .admitted(10, sequence);
        Job::new(request)
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_running_only() {
        let tracker = Tracker::new();
        let job = job_for("u", 1);
        let id = job.id();
        tracker.insert(job).await.unwrap();

        tracker.on_progress(id, 40).await;
        assert_eq!(tracker.get(id).await.unwrap().progress, 0);

        tracker.on_transition(id, JobState::Queued, JobState::Running).await.unwrap();
        tracker.on_progress(id, 40).await;
        tracker.on_progress(id, 20).await;
        assert_eq!(tracker.get(id).await.unwrap().progress, 40);
        tracker.on_progress(id, 180).await;
        assert_eq!(tracker.get(id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_transitions_are_validated_and_recorded() {
        let tracker = Tracker::new();
        let job = job_for("u", 1);
        let id = job.id();
        tracker.insert(job).await.unwrap();

        assert!(tracker.on_transition(id, JobState::Queued, JobState::Succeeded).await.is_err());
        tracker.on_transition(id, JobState::Queued, JobState::Running).await.unwrap();
        tracker.on_transition(id, JobState::Running, JobState::Cancelled).await.unwrap();
        assert!(tracker.on_transition(id, JobState::Cancelled, JobState::Running).await.is_err());

        let history = tracker.history(id).await.unwrap();
        let edges: Vec<(JobState, JobState)> = history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            edges,
            vec![(JobState::Queued, JobState::Running), (JobState::Running, JobState::Cancelled)]
        );

        let unknown = tracker.on_transition(JobId::new(), JobState::Queued, JobState::Running).await;
        assert!(matches!(unknown, Err(JobError::InternalInconsistency(_))));
    }

    #[tokio::test]
    async fn test_list_by_user_newest_first() {
        let tracker = Tracker::new();
        let first = job_for("alice", 1);
        let second = job_for("alice", 2);
        let other = job_for("bob", 3);
        let (first_id, second_id) = (first.id(), second.id());
        tracker.insert(first).await.unwrap();
        tracker.insert(second).await.unwrap();
        tracker.insert(other).await.unwrap();

        let listed: Vec<JobId> = tracker
            .list_by_user(&UserId::from("alice"))
            .await
            .iter()
            .map(|j| j.id())
            .collect();
        assert_eq!(listed, vec![second_id, first_id]);
    }

    #[tokio::test]
    async fn test_evict_only_published_terminal_jobs() {
        let tracker = Tracker::new();
        let done = job_for("u", 1);
        let pending = job_for("u", 2);
        let (done_id, pending_id) = (done.id(), pending.id());
        tracker.insert(done).await.unwrap();
        tracker.insert(pending).await.unwrap();

        tracker.on_transition(done_id, JobState::Queued, JobState::Cancelled).await.unwrap();
        assert!(tracker.evict_finished(Duration::ZERO).await.is_empty());

        tracker.update(done_id, |job| job.published = true).await.unwrap();
        assert!(tracker.evict_finished(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(tracker.evict_finished(Duration::ZERO).await, vec![done_id]);

        assert!(tracker.get(done_id).await.is_none());
        assert!(tracker.get(pending_id).await.is_some());
        assert_eq!(tracker.len().await, 1);
    }
}
