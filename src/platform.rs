//! # Platform-specific utilities
//!
//! Questo modulo risolve gli eseguibili esterni (ffmpeg/ffprobe) in modo
//! cross-platform a partire dalla configurazione del motore.
//!
//! ## Responsabilità:
//! - Aggiunge il suffisso `.exe` su Windows ai nomi senza percorso
//! - Verifica la disponibilità dei tool tramite `which`/`where`
//! - Traduce un tool mancante in `ToolLaunchError`

use crate::config::EngineConfig;
use crate::error::{JobError, JobResult};
use std::path::Path;
use tracing::debug;

/// Resolved executables used by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinaries {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl ToolBinaries {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            ffmpeg: platform_command(&config.ffmpeg_bin),
            ffprobe: platform_command(&config.ffprobe_bin),
        }
    }

    /// Fail with `ToolLaunchError` for the first tool that cannot be found
    pub async fn check_dependencies(&self) -> JobResult<()> {
        for tool in [&self.ffmpeg, &self.ffprobe] {
            if !is_command_available(tool).await {
                return Err(JobError::ToolLaunchError {
                    executable: tool.clone(),
                    reason: "not found on PATH".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Platform-specific command name for a configured executable.
///
/// Explicit paths are kept as given.
pub fn platform_command(name: &str) -> String {
    let has_path = Path::new(name).components().count() > 1;
    if cfg!(windows) && !has_path && !name.to_lowercase().ends_with(".exe") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// Command used to check if a program exists
pub fn which_command() -> &'static str {
    if cfg!(windows) {
        "where"
    } else {
        "which"
    }
}

/// Check if a command is available on the system
pub async fn is_command_available(command: &str) -> bool {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file();
    }

    let result = tokio::process::Command::new(which_command())
        .arg(command)
        .output()
        .await;

    match result {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!("{} lookup for {} failed: {}", which_command(), command, e);
            false
        }
    }
}
