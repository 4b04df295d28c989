//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione del motore dei job.
//!
//! ## Responsabilità:
//! - Definisce la struct `EngineConfig` con tutti i limiti di concorrenza e quota
//! - Fornisce validazione dei parametri prima dell'avvio del motore
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Fornisce valori di default derivati dalla macchina host
//!
//! ## Parametri di configurazione:
//! - `max_worker_slots`: job eseguiti in parallelo (default: metà dei core, min 1)
//! - `per_user_concurrency_limit`: job in esecuzione per utente (default: 1)
//! - `default_tool_timeout_secs`: timeout per singola invocazione (default: 600)
//! - `max_attempts`: tentativi totali per timeout transitori (default: 2)
//! - `workspace_quota_bytes`: spazio riservabile dai workspace (default: 10 GiB)
//! - `max_open_workspaces`: workspace aperti contemporaneamente (default: 64)
//! - `max_input_bytes`: dimensione massima di un input (default: 2 GiB)
//! - `orphan_grace_secs`: età minima di un workspace orfano da rimuovere (default: 3600)
//! - `job_retention_secs`: permanenza in memoria dei job terminati (default: 3600)
//!
//! ## Esempio:
//! ```ignore
//! let config = EngineConfig {
//!     max_worker_slots: 2,
//!     per_user_concurrency_limit: 1,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the media job engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker slots (jobs executing at once)
    pub max_worker_slots: usize,
    /// Jobs of a single user that may run at once
    pub per_user_concurrency_limit: usize,
    /// Timeout applied to each external tool invocation
    pub default_tool_timeout_secs: u64,
    /// Total attempts for a job whose invocation timed out
    pub max_attempts: u32,
    /// Bytes that workspaces may reserve in total
    pub workspace_quota_bytes: u64,
    /// Workspaces that may exist at once
    pub max_open_workspaces: usize,
    /// Largest accepted input file
    pub max_input_bytes: u64,
    /// Directory holding per-job workspaces
    pub workspace_root: PathBuf,
    /// Minimum age before an orphaned workspace is swept on startup
    pub orphan_grace_secs: u64,
    /// How long terminal jobs stay queryable
    pub job_retention_secs: u64,
    /// ffmpeg executable (name on PATH or absolute path)
    pub ffmpeg_bin: String,
    /// ffprobe executable (name on PATH or absolute path)
    pub ffprobe_bin: String,
    /// Optional JSON-lines audit log of finished jobs
    pub audit_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_worker_slots: default_worker_slots(),
            per_user_concurrency_limit: 1,
            default_tool_timeout_secs: 600, // 10 minutes per invocation
            max_attempts: 2,
            workspace_quota_bytes: 10 * 1024 * 1024 * 1024,
            max_open_workspaces: 64,
            max_input_bytes: 2 * 1024 * 1024 * 1024,
            workspace_root: default_workspace_root(),
            orphan_grace_secs: 3600,
            job_retention_secs: 3600,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            audit_log: None,
        }
    }
}

fn default_worker_slots() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

fn default_workspace_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("media-jobs")
        .join("workspaces")
}

impl EngineConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_worker_slots == 0 {
            return Err(anyhow::anyhow!("max_worker_slots must be greater than 0"));
        }

        if self.per_user_concurrency_limit == 0 {
            return Err(anyhow::anyhow!("per_user_concurrency_limit must be greater than 0"));
        }

        if self.default_tool_timeout_secs == 0 {
            return Err(anyhow::anyhow!("default_tool_timeout_secs must be greater than 0"));
        }

        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }

        if self.workspace_quota_bytes == 0 {
            return Err(anyhow::anyhow!("workspace_quota_bytes must be greater than 0"));
        }

        if self.max_open_workspaces == 0 {
            return Err(anyhow::anyhow!("max_open_workspaces must be greater than 0"));
        }

        if self.ffmpeg_bin.trim().is_empty() || self.ffprobe_bin.trim().is_empty() {
            return Err(anyhow::anyhow!("ffmpeg_bin and ffprobe_bin must not be empty"));
        }

        if self.workspace_root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("workspace_root must not be empty"));
        }

        Ok(())
    }

    pub fn default_tool_timeout(&self) -> Duration {
        Duration::from_secs(self.default_tool_timeout_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// Load configuration from file, falling back to defaults when it doesn't exist
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
