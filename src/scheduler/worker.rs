//! Worker loop: takes admissible jobs from the queue and runs each one end-to-end.

use crate::engine::Shared;
use crate::error::{JobError, JobResult};
use crate::invoker::{plan, probe_invocation, ExpectedOutputs, PlanContext, ProbeCache};
use crate::job::{Job, JobId, JobRequest, JobState};
use crate::utils::require_utf8;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) async fn run_worker(index: usize, shared: Arc<Shared>, shutdown: CancellationToken) {
    debug!("Worker {} started", index);

    while let Some((job_id, user_id)) = shared.queue.next_admissible(&shutdown).await {
        let cancel = shared.queue.token(job_id).await.unwrap_or_default();
        info!("Worker {} picked job {}", index, job_id);

        // A panic inside the job task fails only that job
        let handle = tokio::spawn(execute_job(shared.clone(), job_id, cancel));
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!("Job {} panicked during execution", job_id);
                Err(JobError::InternalInconsistency("job execution panicked".to_string()))
            }
            Err(e) => Err(JobError::InternalInconsistency(format!("job task aborted: {}", e))),
        };

        settle_job(&shared, job_id, result).await;
        shared.queue.finish(job_id, &user_id).await;
    }

    debug!("Worker {} stopped", index);
}

/// Record the terminal state and publish it
pub(crate) async fn settle_job(shared: &Shared, job_id: JobId, result: JobResult<Vec<PathBuf>>) {
    match shared.tracker.update(job_id, |job| apply_outcome(job, result)).await {
        Ok(Ok(state)) => match state {
            JobState::Succeeded => info!("Job {} succeeded", job_id),
            JobState::Cancelled => info!("Job {} cancelled", job_id),
            _ => {
                let reason = shared
                    .tracker
                    .get(job_id)
                    .await
                    .and_then(|j| j.error)
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!("Job {} failed: {}", job_id, reason);
            }
        },
        Ok(Err(e)) | Err(e) => error!("Job {} could not be settled: {}", job_id, e),
    }

    shared.publisher.publish(job_id).await;
}

/// Move a job to its terminal state according to `result`
fn apply_outcome(job: &mut Job, result: JobResult<Vec<PathBuf>>) -> JobResult<JobState> {
    let from = job.state;
    let to = match &result {
        Ok(_) => JobState::Succeeded,
        Err(JobError::Cancelled) => JobState::Cancelled,
        Err(_) => JobState::Failed,
    };

    match (from, to) {
        (JobState::Running, _) | (JobState::Queued, JobState::Cancelled) => {}
        // Admission broke before the job could run
        (JobState::Queued, JobState::Failed) if matches!(result, Err(JobError::InternalInconsistency(_))) => {}
        (JobState::Queued, _) => {
            job.transition(JobState::Queued, JobState::Running)?;
        }
        _ => {}
    }

    let current = job.state;
    job.transition(current, to)?;
    if to == JobState::Cancelled {
        // only jobs that ran to Succeeded or Failed keep their workspace path
        job.workspace = None;
    }
    match result {
        Ok(outputs) => job.outputs = outputs,
        Err(e) => job.error = Some(e),
    }
    Ok(to)
}

async fn execute_job(shared: Arc<Shared>, job_id: JobId, cancel: CancellationToken) -> JobResult<Vec<PathBuf>> {
    let job = shared
        .tracker
        .get(job_id)
        .await
        .ok_or_else(|| JobError::InternalInconsistency(format!("job {} vanished before execution", job_id)))?;
    let request = job.request;

    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    let reserve = request.input_bytes().saturating_mul(2);
    let workspace = shared
        .workspaces
        .acquire_when_available(job_id, reserve, &cancel)
        .await?;

    let started = workspace.clone();
    shared
        .tracker
        .update(job_id, move |job| {
            job.transition(JobState::Queued, JobState::Running)?;
            job.workspace = Some(started);
            Ok::<_, JobError>(())
        })
        .await??;
    info!("Job {} running {} in {}", job_id, request.kind(), workspace.display());

    let inputs = absolute_inputs(request.inputs()).await?;
    let probes = ProbeCache::new();
    let max_attempts = shared.config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        shared.tracker.update(job_id, |job| job.attempt = attempt).await?;

        match run_attempt(&shared, &request, &inputs, &workspace, &probes, &cancel).await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    "Job {} attempt {}/{} failed: {}; retrying",
                    job_id, attempt, max_attempts, e
                );
                reset_workspace(&workspace).await?;
            }
            other => return other,
        }
    }
}

async fn run_attempt(
    shared: &Shared,
    request: &JobRequest,
    inputs: &[PathBuf],
    workspace: &Path,
    probes: &ProbeCache,
    cancel: &CancellationToken,
) -> JobResult<Vec<PathBuf>> {
    let job_id = request.job_id();
    let operation = request.operation();
    let timeout = shared.config.default_tool_timeout();
    let first = inputs
        .first()
        .ok_or_else(|| JobError::InternalInconsistency("job without inputs".to_string()))?;

    let duration = if operation.needs_duration() {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let invocation = probe_invocation(&shared.tools.ffprobe, first, workspace, timeout);
        Some(probes.duration(shared.runner.as_ref(), &invocation, first, cancel).await?)
    } else {
        None
    };

    let plan = plan(
        operation,
        &PlanContext {
            inputs,
            workspace,
            ffmpeg: &shared.tools.ffmpeg,
            timeout,
            duration,
        },
    )?;

    if let Some(manifest) = &plan.manifest {
        tokio::fs::write(&manifest.path, &manifest.contents)
            .await
            .map_err(|e| JobError::storage(&format!("cannot write {}", manifest.path.display()), e))?;
    }

    let mut done = usize::from(duration.is_some());
    let total = plan.steps.len() + done;
    shared.tracker.on_progress(job_id, percent(done, total)).await;

    for step in &plan.steps {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        shared.runner.run(step, cancel).await?;
        done += 1;
        shared.tracker.on_progress(job_id, percent(done, total)).await;
    }

    collect_outputs(&plan.outputs).await
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (done.min(total) * 100 / total) as u8
}

async fn absolute_inputs(inputs: &[PathBuf]) -> JobResult<Vec<PathBuf>> {
    let mut resolved = Vec::with_capacity(inputs.len());
    for input in inputs {
        let path = tokio::fs::canonicalize(input)
            .await
            .map_err(|e| JobError::InvalidParameters(format!("input {} is gone: {}", input.display(), e)))?;
        require_utf8(&path)?;
        resolved.push(path);
    }
    Ok(resolved)
}

/// Empty the workspace before a retry
async fn reset_workspace(workspace: &Path) -> JobResult<()> {
    tokio::fs::remove_dir_all(workspace)
        .await
        .map_err(|e| JobError::storage("cannot clear workspace", e))?;
    tokio::fs::create_dir_all(workspace)
        .await
        .map_err(|e| JobError::storage("cannot recreate workspace", e))
}

/// Check that the tool produced what the plan promised
async fn collect_outputs(expected: &ExpectedOutputs) -> JobResult<Vec<PathBuf>> {
    match expected {
        ExpectedOutputs::Files(files) => {
            for file in files {
                if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                    return Err(JobError::tool_failed(
                        0,
                        &format!("expected output {} was not produced", file.display()),
                    ));
                }
            }
            Ok(files.clone())
        }
        ExpectedOutputs::Segments { dir, prefix } => {
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .map_err(|e| JobError::storage("cannot list segments", e))?;
            let mut segments = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| JobError::storage("cannot list segments", e))?
            {
                if entry.file_name().to_string_lossy().starts_with(prefix.as_str()) {
                    segments.push(entry.path());
                }
            }
            if segments.is_empty() {
                return Err(JobError::tool_failed(0, "split produced no segments"));
            }
            segments.sort();
            Ok(segments)
        }
    }
}
