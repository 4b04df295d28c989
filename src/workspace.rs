//! # Workspace Manager Module
//!
//! Questo modulo gestisce le directory temporanee di lavoro dei job.
//!
//! ## Responsabilità:
//! - Alloca una directory `job-<id>` per ogni job in esecuzione
//! - Applica la quota disco (per prenotazione) e il numero massimo di workspace aperti
//! - Attende capacità libera con risveglio al rilascio o re-poll periodico
//! - Rilascio idempotente e contato per job
//! - Rimozione dei workspace orfani all'avvio
//!
//! ## Esempio:
//! ```ignore
//! let path = workspaces.acquire_when_available(job_id, bytes * 2, &cancel).await?;
//! // ... run tools in `path` ...
//! workspaces.release(job_id).await;
//! ```

use crate::config::EngineConfig;
use crate::error::{JobError, JobResult};
use crate::file_manager::FileManager;
use crate::job::JobId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Re-poll period while waiting for capacity
const CAPACITY_POLL: Duration = Duration::from_secs(1);

const WORKSPACE_PREFIX: &str = "job-";

#[derive(Debug)]
struct Lease {
    path: PathBuf,
    reserved: u64,
}

#[derive(Debug, Default)]
struct Leases {
    active: HashMap<JobId, Lease>,
    reserved_bytes: u64,
    release_calls: HashMap<JobId, u32>,
}

/// Allocates and reclaims per-job scratch directories
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    quota_bytes: u64,
    max_open: usize,
    leases: Mutex<Leases>,
    released: Notify,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, quota_bytes: u64, max_open: usize) -> Self {
        Self {
            root: root.into(),
            quota_bytes,
            max_open,
            leases: Mutex::new(Leases::default()),
            released: Notify::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.workspace_root.clone(),
            config.workspace_quota_bytes,
            config.max_open_workspaces,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a reservation could ever be granted
    pub fn fits_quota(&self, reserve_bytes: u64) -> bool {
        reserve_bytes <= self.quota_bytes
    }

    /// Reserve space and create the job's directory.
    ///
    /// Fails with `ResourceExhausted` when either quota would be exceeded.
    pub async fn acquire(&self, job_id: JobId, reserve_bytes: u64) -> JobResult<PathBuf> {
        let mut leases = self.leases.lock().await;

        if leases.active.contains_key(&job_id) {
            return Err(JobError::InternalInconsistency(format!(
                "job {} already holds a workspace",
                job_id
            )));
        }

        if leases.active.len() >= self.max_open {
            return Err(JobError::ResourceExhausted(format!(
                "{} workspaces already open",
                leases.active.len()
            )));
        }

        let available = self.quota_bytes.saturating_sub(leases.reserved_bytes);
        if reserve_bytes > available {
            return Err(JobError::ResourceExhausted(format!(
                "workspace needs {} but only {} of the quota is free",
                FileManager::format_size(reserve_bytes),
                FileManager::format_size(available)
            )));
        }

        let path = self.root.join(job_id.workspace_dir_name());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| JobError::storage(&format!("cannot create {}", path.display()), e))?;

        leases.reserved_bytes += reserve_bytes;
        leases.active.insert(
            job_id,
            Lease {
                path: path.clone(),
                reserved: reserve_bytes,
            },
        );

        debug!(
            "Workspace {} acquired ({} reserved)",
            path.display(),
            FileManager::format_size(reserve_bytes)
        );
        Ok(path)
    }

    /// Wait until the reservation can be granted or `cancel` fires.
    ///
    /// Requests larger than the whole quota fail immediately.
    pub async fn acquire_when_available(
        &self,
        job_id: JobId,
        reserve_bytes: u64,
        cancel: &CancellationToken,
    ) -> JobResult<PathBuf> {
        loop {
            let notified = self.released.notified();
            match self.acquire(job_id, reserve_bytes).await {
                Err(JobError::ResourceExhausted(reason)) if self.fits_quota(reserve_bytes) => {
                    debug!("Job {} waiting for workspace capacity: {}", job_id, reason);
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(CAPACITY_POLL) => {}
                        _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    /// Delete the job's directory. Unknown ids and repeated calls are no-ops.
    pub async fn release(&self, job_id: JobId) {
        let lease = {
            let mut leases = self.leases.lock().await;
            *leases.release_calls.entry(job_id).or_default() += 1;
            let lease = leases.active.remove(&job_id);
            if let Some(lease) = &lease {
                leases.reserved_bytes = leases.reserved_bytes.saturating_sub(lease.reserved);
            }
            lease
        };

        match lease {
            Some(lease) => {
                let used = FileManager::dir_size(&lease.path);
                if let Err(e) = tokio::fs::remove_dir_all(&lease.path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove workspace {}: {}", lease.path.display(), e);
                    }
                }
                debug!(
                    "Workspace {} released ({} used)",
                    lease.path.display(),
                    FileManager::format_size(used)
                );
                self.released.notify_waiters();
            }
            None => debug!("Job {} holds no workspace, nothing to release", job_id),
        }
    }

    /// Number of `release` calls seen for a job
    pub async fn release_count(&self, job_id: JobId) -> u32 {
        self.leases
            .lock()
            .await
            .release_calls
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }

    /// Drop bookkeeping for an evicted job
    pub async fn forget(&self, job_id: JobId) {
        self.leases.lock().await.release_calls.remove(&job_id);
    }

    pub async fn open_count(&self) -> usize {
        self.leases.lock().await.active.len()
    }

    pub async fn reserved_bytes(&self) -> u64 {
        self.leases.lock().await.reserved_bytes
    }

    /// Remove `job-*` directories not owned by a live lease and older than `grace`
    pub async fn sweep_orphans(&self, grace: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Nothing to sweep in {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let leases = self.leases.lock().await;
        let owned: Vec<&PathBuf> = leases.active.values().map(|l| &l.path).collect();
        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error scanning {}: {}", self.root.display(), e);
                    break;
                }
            };

            let path = entry.path();
            let is_job_dir = entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX)
                && entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_job_dir || owned.contains(&&path) {
                continue;
            }

            let age = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < grace {
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!("Removed orphaned workspace {}", path.display());
                }
                Err(e) => warn!("Failed to remove orphaned workspace {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Swept {} orphaned workspaces from {}", removed, self.root.display());
        }
        removed
    }
}
