//! # Job Progress Display Module
//!
//! Barra di avanzamento per la CLI, alimentata dagli snapshot di stato del motore.
//!
//! ## Responsabilità:
//! - Progress bar `indicatif` in percentuale (0–100) per un singolo job
//! - Messaggio con lo stato corrente del job
//! - Riepilogo finale leggibile dal `JobNotice`
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:00:12] [=========================>--------------]  62% running
//! ```
//!
//! ## Esempio:
//! ```ignore
//! let progress = JobProgress::new(job_id);
//! progress.update(&engine.query_status(job_id).await?);
//! progress.finish(&summarize(&notice));
//! ```

use crate::file_manager::FileManager;
use crate::job::{JobId, JobState, JobStatus};
use crate::publisher::JobNotice;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar following one job
#[derive(Clone)]
pub struct JobProgress {
    bar: ProgressBar,
}

impl JobProgress {
    pub fn new(job_id: JobId) -> Self {
        let bar = ProgressBar::new(100);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_message(format!("{} queued", job_id));
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Hidden bar, for non-interactive output
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn update(&self, status: &JobStatus) {
        self.bar.set_position(u64::from(status.progress));
        self.bar.set_message(status.state.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

/// One-line summary of a finished job
pub fn summarize(notice: &JobNotice) -> String {
    match notice.state {
        JobState::Succeeded => {
            let bytes: u64 = notice
                .outputs
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum();
            format!(
                "✅ {} {}: {} output(s), {}",
                notice.kind,
                notice.job_id,
                notice.outputs.len(),
                FileManager::format_size(bytes)
            )
        }
        JobState::Cancelled => format!("⏹ {} {} cancelled", notice.kind, notice.job_id),
        _ => format!(
            "❌ {} {} failed: {}",
            notice.kind,
            notice.job_id,
            notice.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::UserId;
    use crate::operation::OperationKind;
    use tempfile::TempDir;

    fn notice(state: JobState) -> JobNotice {
        JobNotice {
            job_id: JobId::new(),
            user_id: UserId::from("u"),
            kind: OperationKind::Split,
            state,
            outputs: vec![],
            error: None,
            notices: vec![],
        }
    }

    #[test]
    fn test_progress_follows_status() {
        let progress = JobProgress::hidden();
        let status = JobStatus {
            job_id: JobId::new(),
            state: JobState::Running,
            progress: 40,
            outputs: vec![],
            error: None,
            delivery_error: None,
            notices: vec![],
        };
        progress.update(&status);
        assert_eq!(progress.position(), 40);
    }

    #[test]
    fn test_summaries() {
        let dir = TempDir::new().unwrap();
        let segment = dir.path().join("segment_000.mp4");
        std::fs::write(&segment, vec![0u8; 2048]).unwrap();

        let mut done = notice(JobState::Succeeded);
        done.outputs = vec![segment];
        let summary = summarize(&done);
        assert!(summary.contains("1 output(s)"));
        assert!(summary.contains("2.00 KB"));

        let mut failed = notice(JobState::Failed);
        failed.error = Some("Tool exited with code 1: bad input".into());
        assert!(summarize(&failed).contains("bad input"));

        assert!(summarize(&notice(JobState::Cancelled)).contains("cancelled"));
    }
}
