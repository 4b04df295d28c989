//! # Media Job Engine
//!
//! Punto di ingresso della libreria: un'istanza esplicita che possiede la
//! configurazione, l'indice dei job, la coda e il pool di worker.
//!
//! ## Responsabilità:
//! - Avvio: validazione config, sweep dei workspace orfani, spawn dei worker
//! - Sottomissione: validazione input, quota, inserimento in coda
//! - Query di stato, cancellazione, elenco per utente, storico transizioni
//! - Eviction periodica dei job terminati
//! - Shutdown: i job in coda diventano `Cancelled`, quelli in esecuzione vengono cancellati
//!
//! ## Esempio:
//! ```ignore
//! let (sink, mut results) = ChannelSink::new();
//! let engine = MediaJobEngine::start(config, Arc::new(ProcessRunner::new()), Arc::new(sink)).await?;
//! let job_id = engine.submit_job(OperationKind::Trim, inputs, params, UserId::from(42)).await?;
//! let notice = results.recv().await;
//! engine.shutdown().await;
//! ```

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::error::{JobError, JobResult};
use crate::file_manager::FileManager;
use crate::invoker::ToolRunner;
use crate::job::{Job, JobId, JobRequest, JobStatus, Transition, UserId};
use crate::operation::OperationKind;
use crate::platform::ToolBinaries;
use crate::publisher::{Publisher, ResultSink};
use crate::scheduler::worker::{run_worker, settle_job};
use crate::scheduler::JobQueue;
use crate::tracker::Tracker;
use crate::workspace::WorkspaceManager;
use anyhow::Result;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound between two eviction sweeps
const EVICTION_PERIOD: Duration = Duration::from_secs(60);

/// State shared by the engine facade and its workers
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) tools: ToolBinaries,
    pub(crate) tracker: Arc<Tracker>,
    pub(crate) queue: JobQueue,
    pub(crate) workspaces: Arc<WorkspaceManager>,
    pub(crate) runner: Arc<dyn ToolRunner>,
    pub(crate) publisher: Publisher,
}

pub struct MediaJobEngine {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaJobEngine {
    /// Validate `config`, sweep orphaned workspaces and start the worker pool
    pub async fn start(config: EngineConfig, runner: Arc<dyn ToolRunner>, sink: Arc<dyn ResultSink>) -> Result<Self> {
        config.validate()?;

        let tracker = Arc::new(Tracker::new());
        let workspaces = Arc::new(WorkspaceManager::from_config(&config));
        let swept = workspaces.sweep_orphans(config.orphan_grace()).await;
        if swept > 0 {
            info!("Removed {} orphaned workspaces", swept);
        }

        let audit = match &config.audit_log {
            Some(path) => Some(AuditLog::open(path).await?),
            None => None,
        };
        let publisher = Publisher::new(tracker.clone(), workspaces.clone(), sink, audit);

        let shared = Arc::new(Shared {
            tools: ToolBinaries::from_config(&config),
            queue: JobQueue::new(config.per_user_concurrency_limit),
            tracker,
            workspaces,
            runner,
            publisher,
            config,
        });

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(shared.config.max_worker_slots + 1);
        for index in 0..shared.config.max_worker_slots {
            tasks.push(tokio::spawn(run_worker(index, shared.clone(), shutdown.clone())));
        }
        tasks.push(tokio::spawn(evict_periodically(shared.clone(), shutdown.clone())));

        info!(
            "Media job engine started: {} workers, {} per user, workspaces in {}",
            shared.config.max_worker_slots,
            shared.config.per_user_concurrency_limit,
            shared.workspaces.root().display()
        );

        Ok(Self {
            shared,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Validate parameters and inputs, then queue the job
    pub async fn submit_job(
        &self,
        kind: OperationKind,
        inputs: Vec<PathBuf>,
        parameters: BTreeMap<String, String>,
        user_id: UserId,
    ) -> JobResult<JobId> {
        let request = JobRequest::new(user_id, kind, inputs, parameters)?;
        self.submit(request).await
    }

    /// Queue a prepared request
    pub async fn submit(&self, request: JobRequest) -> JobResult<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(JobError::ResourceExhausted("engine is shutting down".to_string()));
        }

        let kinds = request.operation().expected_input_kinds(request.inputs().len());
        let mut input_bytes = 0u64;
        for (input, kind) in request.inputs().iter().zip(kinds) {
            input_bytes += FileManager::inspect_input(input, kind, self.shared.config.max_input_bytes).await?;
        }

        let reserve = input_bytes.saturating_mul(2);
        if !self.shared.workspaces.fits_quota(reserve) {
            return Err(JobError::ResourceExhausted(format!(
                "job needs {} of workspace, the quota is {}",
                FileManager::format_size(reserve),
                FileManager::format_size(self.shared.config.workspace_quota_bytes)
            )));
        }

        let job_id = request.job_id();
        let user_id = request.user_id().clone();
        let kind = request.kind();
        let input_count = request.inputs().len();
        let notices = request.notices().to_vec();

        self.shared.queue.enqueue(request, input_bytes, &self.shared.tracker).await?;

        for notice in &notices {
            warn!("Job {}: {}", job_id, notice);
        }
        info!(
            "Job {} submitted by {}: {} on {} input(s), {}",
            job_id,
            user_id,
            kind,
            input_count,
            FileManager::format_size(input_bytes)
        );
        Ok(job_id)
    }

    pub async fn query_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.shared.tracker.get(job_id).await.map(|job| job.status())
    }

    /// Full job record snapshot
    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        self.shared.tracker.get(job_id).await
    }

    /// Cancel a queued or running job. `false` for unknown or finished jobs.
    pub async fn cancel_job(&self, job_id: JobId) -> bool {
        if self.shared.queue.cancel_pending(job_id).await {
            info!("Job {} cancelled while queued", job_id);
            settle_job(&self.shared, job_id, Err(JobError::Cancelled)).await;
            return true;
        }

        match self.shared.tracker.get(job_id).await {
            Some(job) if !job.state.is_terminal() => match self.shared.queue.token(job_id).await {
                Some(token) => {
                    info!("Cancelling running job {}", job_id);
                    token.cancel();
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub async fn list_by_user(&self, user_id: &UserId) -> Vec<JobStatus> {
        self.shared
            .tracker
            .list_by_user(user_id)
            .await
            .iter()
            .map(Job::status)
            .collect()
    }

    pub async fn history(&self, job_id: JobId) -> Option<Vec<Transition>> {
        self.shared.tracker.history(job_id).await
    }

    /// Number of `release` calls seen for a job's workspace
    pub async fn release_count(&self, job_id: JobId) -> u32 {
        self.shared.workspaces.release_count(job_id).await
    }

    /// Cancel queued jobs, stop running ones and wait for the workers
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down media job engine");

        let drained = self.shared.queue.close().await;
        self.shutdown.cancel();
        for job_id in drained {
            settle_job(&self.shared, job_id, Err(JobError::Cancelled)).await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        info!("Media job engine stopped");
    }
}

async fn evict_periodically(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = shared.config.job_retention().min(EVICTION_PERIOD).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = shared.tracker.evict_finished(shared.config.job_retention()).await;
                for job_id in &evicted {
                    shared.workspaces.forget(*job_id).await;
                }
                if !evicted.is_empty() {
                    debug!("Evicted {} finished jobs", evicted.len());
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{ToolInvocation, ToolOutput};
    use crate::job::JobState;
    use crate::publisher::{ChannelSink, JobNotice};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_test::assert_ok;

    /// Pretends to be ffmpeg/ffprobe: writes the output file named by the last argument
    #[derive(Default)]
    struct FakeRunner {
        delay: Duration,
        timeouts_left: AtomicUsize,
        fail_with_exit: Option<i32>,
        panic_once: AtomicBool,
        probe_duration: f64,
        calls: std::sync::Mutex<Vec<ToolInvocation>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                probe_duration: 95.0,
                ..Default::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> Vec<ToolInvocation> {
            self.calls.lock().unwrap().clone()
        }

        fn ffmpeg_calls(&self) -> Vec<ToolInvocation> {
            self.calls().into_iter().filter(|c| !c.executable.contains("ffprobe")).collect()
        }
    }

    #[async_trait]
    impl ToolRunner for FakeRunner {
        async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> JobResult<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if invocation.executable.contains("ffprobe") {
                return Ok(ToolOutput {
                    stdout: format!("{}\n", self.probe_duration),
                    ..Default::default()
                });
            }
            if self.panic_once.swap(false, Ordering::SeqCst) {
                panic!("simulated tool crash");
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let outcome = tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(()),
                _ = cancel.cancelled() => Err(JobError::Cancelled),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome?;

            let remaining = self.timeouts_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.timeouts_left.store(remaining - 1, Ordering::SeqCst);
                return Err(JobError::ToolTimeout {
                    executable: invocation.executable.clone(),
                    timeout_ms: invocation.timeout.as_millis() as u64,
                });
            }
            if let Some(code) = self.fail_with_exit {
                return Err(JobError::tool_failed(code, "Invalid data found when processing input"));
            }

            let output = invocation.args.last().cloned().unwrap_or_default().replace("%03d", "000");
            std::fs::write(&output, b"media").map_err(|e| JobError::storage("fake output", e))?;
            Ok(ToolOutput::default())
        }
    }

    struct Harness {
        _dir: TempDir,
        inputs: PathBuf,
        engine: MediaJobEngine,
        runner: Arc<FakeRunner>,
        results: UnboundedReceiver<JobNotice>,
    }

    impl Harness {
        async fn start(runner: FakeRunner, tune: impl FnOnce(&mut EngineConfig)) -> Self {
            let dir = TempDir::new().unwrap();
            let inputs = dir.path().join("inputs");
            std::fs::create_dir(&inputs).unwrap();
            for name in ["clip.mp4", "other.mp4", "en.srt"] {
                std::fs::write(inputs.join(name), vec![0u8; 1024]).unwrap();
            }

            let mut config = EngineConfig {
                max_worker_slots: 2,
                workspace_root: dir.path().join("workspaces"),
                ..Default::default()
            };
            tune(&mut config);

            let runner = Arc::new(runner);
            let (sink, results) = ChannelSink::new();
            let engine = MediaJobEngine::start(config, runner.clone(), Arc::new(sink)).await.unwrap();
            Self {
                _dir: dir,
                inputs,
                engine,
                runner,
                results,
            }
        }

        fn input(&self, name: &str) -> PathBuf {
            self.inputs.join(name)
        }

        async fn submit(&self, kind: OperationKind, params: &[(&str, &str)], inputs: &[&str], user: &str) -> JobResult<JobId> {
            let params = params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            let inputs = inputs.iter().map(|name| self.input(name)).collect();
            self.engine.submit_job(kind, inputs, params, UserId::from(user)).await
        }

        async fn next_result(&mut self) -> JobNotice {
            tokio::time::timeout(Duration::from_secs(10), self.results.recv())
                .await
                .expect("timed out waiting for a job result")
                .expect("result channel closed")
        }
    }

    #[tokio::test]
    async fn test_thumbnail_job_succeeds() {
        let mut h = Harness::start(FakeRunner::new(), |_| {}).await;
        let id = assert_ok!(h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], "u").await);

        let notice = h.next_result().await;
        assert_eq!(notice.job_id, id);
        assert_eq!(notice.state, JobState::Succeeded);
        assert_eq!(notice.outputs.len(), 1);
        assert!(notice.outputs[0].ends_with("thumbnail.jpg"));

        let status = h.engine.query_status(id).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.progress, 100);
        assert_eq!(h.engine.release_count(id).await, 1);

        let history = h.engine.history(id).await.unwrap();
        let states: Vec<JobState> = history.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![JobState::Running, JobState::Succeeded]);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_at_most_two_jobs_run_at_once() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(100));
        let mut h = Harness::start(runner, |c| c.max_worker_slots = 2).await;

        for user in ["a", "b", "c", "d", "e"] {
            assert_ok!(h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], user).await);
        }
        for _ in 0..5 {
            assert_eq!(h.next_result().await.state, JobState::Succeeded);
        }
        assert!(h.runner.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.runner.ffmpeg_calls().len(), 5);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_running_job_per_user() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(50));
        let mut h = Harness::start(runner, |c| c.max_worker_slots = 3).await;

        for _ in 0..3 {
            assert_ok!(h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], "same-user").await);
        }
        for _ in 0..3 {
            h.next_result().await;
        }
        assert_eq!(h.runner.max_running.load(Ordering::SeqCst), 1);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_is_retried_once_with_same_arguments() {
        let runner = FakeRunner {
            timeouts_left: AtomicUsize::new(1),
            ..FakeRunner::new()
        };
        let mut h = Harness::start(runner, |c| c.max_attempts = 2).await;
        let id = assert_ok!(h.submit(OperationKind::Optimize, &[("preset", "high")], &["clip.mp4"], "u").await);

        let notice = h.next_result().await;
        assert_eq!(notice.state, JobState::Succeeded);

        let calls = h.runner.ffmpeg_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(h.engine.get(id).await.unwrap().attempt, 2);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_timeout_fails_the_job() {
        let runner = FakeRunner {
            timeouts_left: AtomicUsize::new(2),
            ..FakeRunner::new()
        };
        let mut h = Harness::start(runner, |c| c.max_attempts = 2).await;
        let id = assert_ok!(h.submit(OperationKind::Optimize, &[], &["clip.mp4"], "u").await);

        let notice = h.next_result().await;
        assert_eq!(notice.state, JobState::Failed);
        assert_eq!(h.runner.ffmpeg_calls().len(), 2);
        let job = h.engine.get(id).await.unwrap();
        assert!(matches!(job.error, Some(JobError::ToolTimeout { .. })));
        assert_eq!(h.engine.release_count(id).await, 1);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_tool_failure_is_not_retried() {
        let runner = FakeRunner {
            fail_with_exit: Some(1),
            ..FakeRunner::new()
        };
        let mut h = Harness::start(runner, |c| c.max_attempts = 3).await;
        let id = assert_ok!(h.submit(OperationKind::Trim, &[("start", "1"), ("end", "2")], &["clip.mp4"], "u").await);

        let notice = h.next_result().await;
        assert_eq!(notice.state, JobState::Failed);
        assert!(notice.error.unwrap().contains("Invalid data"));
        assert_eq!(h.runner.ffmpeg_calls().len(), 1);
        assert!(matches!(
            h.engine.get(id).await.unwrap().error,
            Some(JobError::ToolFailed { exit_code: 1, .. })
        ));
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_screenshot_interval_gives_three_frames() {
        let mut h = Harness::start(FakeRunner::new(), |_| {}).await;
        assert_ok!(h.submit(OperationKind::Screenshot, &[("interval", "30")], &["clip.mp4"], "u").await);

        let notice = h.next_result().await;
        assert_eq!(notice.state, JobState::Succeeded);
        assert_eq!(notice.outputs.len(), 3);

        let probes = h.runner.calls().len() - h.runner.ffmpeg_calls().len();
        assert_eq!(probes, 1);
        let seeks: Vec<String> = h
            .runner
            .ffmpeg_calls()
            .iter()
            .map(|c| c.args[c.args.iter().position(|a| a == "-ss").unwrap() + 1].clone())
            .collect();
        assert_eq!(seeks, vec!["0.000", "30.000", "60.000"]);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_a_tool() {
        let h = Harness::start(FakeRunner::new(), |_| {}).await;

        let trim = h.submit(OperationKind::Trim, &[("start", "10"), ("end", "5")], &["clip.mp4"], "u").await;
        assert!(matches!(trim, Err(JobError::InvalidParameters(_))));

        let merge = h.submit(OperationKind::Merge, &[], &["clip.mp4"], "u").await;
        assert!(matches!(merge, Err(JobError::InvalidParameters(_))));

        let missing = h.submit(OperationKind::Thumbnail, &[], &["absent.mp4"], "u").await;
        assert!(matches!(missing, Err(JobError::InvalidParameters(_))));

        let wrong_kind = h.submit(OperationKind::Subtitle, &[("mode", "soft")], &["clip.mp4", "other.mp4"], "u").await;
        assert!(matches!(wrong_kind, Err(JobError::InvalidParameters(_))));

        assert!(h.runner.calls().is_empty());
        assert_eq!(h.engine.shared.workspaces.open_count().await, 0);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_job_is_rejected_at_submission() {
        let h = Harness::start(FakeRunner::new(), |c| c.workspace_quota_bytes = 1024).await;
        let result = h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], "u").await;
        assert!(matches!(result, Err(JobError::ResourceExhausted(_))));
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running_jobs() {
        let runner = FakeRunner::new().with_delay(Duration::from_secs(30));
        let mut h = Harness::start(runner, |c| c.max_worker_slots = 1).await;

        let running = assert_ok!(h.submit(OperationKind::Optimize, &[], &["clip.mp4"], "a").await);
        let queued = assert_ok!(h.submit(OperationKind::Optimize, &[], &["other.mp4"], "b").await);

        while h.runner.running.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(h.engine.cancel_job(queued).await);
        let notice = h.next_result().await;
        assert_eq!(notice.job_id, queued);
        assert_eq!(notice.state, JobState::Cancelled);
        assert_eq!(h.engine.release_count(queued).await, 1);
        assert!(!h.engine.cancel_job(queued).await);

        assert!(h.engine.cancel_job(running).await);
        let notice = h.next_result().await;
        assert_eq!(notice.job_id, running);
        assert_eq!(notice.state, JobState::Cancelled);

        // Only the running job ever reached the tool
        let inputs: HashSet<String> = h.runner.calls().iter().map(|c| c.args.join(" ")).collect();
        assert_eq!(inputs.len(), 1);
        assert!(inputs.iter().all(|args| args.contains("clip.mp4")));
        assert!(!h.engine.cancel_job(JobId::new()).await);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let runner = FakeRunner {
            panic_once: AtomicBool::new(true),
            ..FakeRunner::new()
        };
        let mut h = Harness::start(runner, |c| c.max_worker_slots = 1).await;

        let crashed = assert_ok!(h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], "u").await);
        let notice = h.next_result().await;
        assert_eq!(notice.job_id, crashed);
        assert_eq!(notice.state, JobState::Failed);
        assert!(matches!(
            h.engine.get(crashed).await.unwrap().error,
            Some(JobError::InternalInconsistency(_))
        ));
        assert_eq!(h.engine.release_count(crashed).await, 1);

        assert_ok!(h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], "u").await);
        assert_eq!(h.next_result().await.state, JobState::Succeeded);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_terminal_job_released_exactly_once() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(20));
        let mut h = Harness::start(runner, |c| c.max_worker_slots = 2).await;

        let mut ids = Vec::new();
        ids.push(assert_ok!(h.submit(OperationKind::Merge, &[], &["clip.mp4", "other.mp4"], "a").await));
        ids.push(assert_ok!(h.submit(OperationKind::Split, &[("mode", "count"), ("value", "3")], &["clip.mp4"], "b").await));
        ids.push(assert_ok!(h.submit(OperationKind::Subtitle, &[("mode", "burn")], &["clip.mp4", "en.srt"], "c").await));
        ids.push(assert_ok!(h.submit(OperationKind::Thumbnail, &[("count", "2")], &["clip.mp4"], "a").await));
        let cancelled = assert_ok!(h.submit(OperationKind::Optimize, &[], &["clip.mp4"], "a").await);
        assert!(h.engine.cancel_job(cancelled).await);
        ids.push(cancelled);

        for _ in 0..ids.len() {
            h.next_result().await;
        }
        for id in &ids {
            let status = h.engine.query_status(*id).await.unwrap();
            assert!(status.state.is_terminal());
            assert_eq!(h.engine.release_count(*id).await, 1, "job {} ({:?})", id, status.state);
        }
        assert_eq!(h.engine.shared.workspaces.open_count().await, 0);

        let listed = h.engine.list_by_user(&UserId::from("a")).await;
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].job_id, cancelled);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_preset_notice_reaches_caller() {
        let mut h = Harness::start(FakeRunner::new(), |_| {}).await;
        let id = assert_ok!(h.submit(OperationKind::Optimize, &[("preset", "extreme")], &["clip.mp4"], "u").await);
        let notice = h.next_result().await;
        assert_eq!(notice.state, JobState::Succeeded);
        assert_eq!(notice.notices.len(), 1);
        assert_eq!(h.engine.query_status(id).await.unwrap().notices, notice.notices);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_jobs() {
        let runner = FakeRunner::new().with_delay(Duration::from_secs(30));
        let mut h = Harness::start(runner, |c| c.max_worker_slots = 1).await;

        let first = assert_ok!(h.submit(OperationKind::Optimize, &[], &["clip.mp4"], "a").await);
        let second = assert_ok!(h.submit(OperationKind::Optimize, &[], &["clip.mp4"], "b").await);
        while h.runner.running.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.engine.shutdown().await;
        let mut states = vec![h.next_result().await, h.next_result().await];
        states.sort_by_key(|n| n.job_id != first);
        assert_eq!(states[0].state, JobState::Cancelled);
        assert_eq!(states[1].job_id, second);
        assert_eq!(states[1].state, JobState::Cancelled);

        let late = h.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], "c").await;
        assert!(matches!(late, Err(JobError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_submit_racing_shutdown_never_strands_a_job() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(20));
        let mut h = Harness::start(runner, |_| {}).await;

        let harness = &h;
        let submits = join_all((0..20).map(|i| async move {
            let user = format!("user-{}", i);
            harness.submit(OperationKind::Thumbnail, &[], &["clip.mp4"], &user).await
        }));
        let (results, ()) = tokio::join!(submits, async {
            tokio::task::yield_now().await;
            harness.engine.shutdown().await
        });

        let accepted: Vec<JobId> = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(id) => Some(id),
                Err(JobError::ResourceExhausted(_)) => None,
                Err(e) => panic!("unexpected error: {e}"),
            })
            .collect();

        let mut published = HashSet::new();
        for _ in 0..accepted.len() {
            published.insert(h.next_result().await.job_id);
        }
        for id in &accepted {
            assert!(published.contains(id));
            assert!(h.engine.query_status(*id).await.unwrap().state.is_terminal());
            assert_eq!(h.engine.release_count(*id).await, 1);
        }
    }
}
