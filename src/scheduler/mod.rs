//! # Job Queue & Scheduler Module
//!
//! Questo modulo gestisce la coda dei job e la loro assegnazione ai worker.
//!
//! ## Responsabilità:
//! - Coda FIFO illimitata per ordine di sottomissione
//! - Limite di job in esecuzione per utente (le voci saltate mantengono la posizione)
//! - Un `CancellationToken` per job, usato dalla cancellazione cooperativa
//! - Risveglio dei worker tramite `Notify` su enqueue e completamento
//!
//! ## Flusso:
//! 1. `enqueue` assegna l'ordine di arrivo, registra il job e ne crea il token
//! 2. `next_admissible` restituisce il primo job il cui utente ha slot liberi
//! 3. `finish` libera lo slot dell'utente e scarta il token

pub mod worker;

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobRequest, UserId};
use crate::tracker::Tracker;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Pending {
    job_id: JobId,
    user_id: UserId,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    running_per_user: HashMap<UserId, usize>,
    tokens: HashMap<JobId, CancellationToken>,
    next_sequence: u64,
    closed: bool,
}

/// FIFO queue with per-user fairness
#[derive(Debug)]
pub struct JobQueue {
    per_user_limit: usize,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl JobQueue {
    pub fn new(per_user_limit: usize) -> Self {
        Self {
            per_user_limit: per_user_limit.max(1),
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
        }
    }

    /// Stamp the admission order, track the job and append it.
    ///
    /// The queue lock is held across the tracker insert so queue order,
    /// `sequence` and `submitted_at` always agree. Fails once the queue is closed.
    pub async fn enqueue(&self, request: JobRequest, input_bytes: u64, tracker: &Tracker) -> JobResult<JobId> {
        let job_id = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(JobError::ResourceExhausted("engine is shutting down".to_string()));
            }

            let request = request.admitted(input_bytes, state.next_sequence);
            let job_id = request.job_id();
            let user_id = request.user_id().clone();
            tracker.insert(Job::new(request)).await?;

            state.next_sequence += 1;
            state.tokens.insert(job_id, CancellationToken::new());
            state.pending.push_back(Pending { job_id, user_id });
            debug!("Job {} queued ({} pending)", job_id, state.pending.len());
            job_id
        };
        self.changed.notify_waiters();
        Ok(job_id)
    }

    /// Wait for the oldest job whose user is under the limit.
    ///
    /// Returns `None` once `shutdown` fires or the queue is closed.
    pub async fn next_admissible(&self, shutdown: &CancellationToken) -> Option<(JobId, UserId)> {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed || shutdown.is_cancelled() {
                    return None;
                }

                let limit = self.per_user_limit;
                let position = state.pending.iter().position(|p| {
                    state.running_per_user.get(&p.user_id).copied().unwrap_or(0) < limit
                });
                if let Some(entry) = position.and_then(|i| state.pending.remove(i)) {
                    *state.running_per_user.entry(entry.user_id.clone()).or_default() += 1;
                    return Some((entry.job_id, entry.user_id));
                }
            }

            tokio::select! {
                _ = changed => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Release the user's slot after a dispatched job ended
    pub async fn finish(&self, job_id: JobId, user_id: &UserId) {
        {
            let mut state = self.state.lock().await;
            state.tokens.remove(&job_id);
            if let Some(count) = state.running_per_user.get_mut(user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.running_per_user.remove(user_id);
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// Remove a job that has not been dispatched yet. `false` if it isn't pending.
    pub async fn cancel_pending(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock().await;
        match state.pending.iter().position(|p| p.job_id == job_id) {
            Some(i) => {
                state.pending.remove(i);
                if let Some(token) = state.tokens.remove(&job_id) {
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub async fn token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.state.lock().await.tokens.get(&job_id).cloned()
    }

    /// Stop dispatching, cancel dispatched jobs and hand back the undispatched ones
    pub async fn close(&self) -> Vec<JobId> {
        let drained = {
            let mut state = self.state.lock().await;
            state.closed = true;
            for token in state.tokens.values() {
                token.cancel();
            }
            let drained: Vec<JobId> = state.pending.drain(..).map(|p| p.job_id).collect();
            for job_id in &drained {
                state.tokens.remove(job_id);
            }
            drained
        };
        self.changed.notify_waiters();
        drained
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn running_for(&self, user_id: &UserId) -> usize {
        self.state
            .lock()
            .await
            .running_per_user
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}
