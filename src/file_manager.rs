//! # File Management Module
//!
//! Questo modulo gestisce l'ispezione dei file di input e le utilità sulle dimensioni.
//!
//! ## Responsabilità:
//! - Riconoscimento del tipo di media dall'estensione (video, sottotitoli)
//! - Ispezione degli input al momento della sottomissione (esistenza, dimensione)
//! - Applicazione del limite di dimensione per singolo file
//! - Calcolo dello spazio occupato da un workspace
//! - Formattazione human-readable delle dimensioni
//!
//! ## Formati supportati:
//! - **Video**: MP4, AVI, MKV, MOV, WebM, FLV, WMV, M4V
//! - **Sottotitoli**: SRT, ASS, SSA, VTT, SUB
//!
//! ## Esempio:
//! ```ignore
//! let bytes = FileManager::inspect_input(&path, MediaKind::Video, max_bytes).await?;
//! info!("input size: {}", FileManager::format_size(bytes));
//! ```

use crate::error::{JobError, JobResult};
use std::path::Path;
use tokio::fs;
use walkdir::WalkDir;

/// Broad category of a media file, derived from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Subtitle,
}

impl MediaKind {
    fn label(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Subtitle => "subtitle",
        }
    }
}

/// Manages input inspection and size bookkeeping
pub struct FileManager;

impl FileManager {
    /// Lowercased extension of a path, if any
    pub fn extension(path: &Path) -> Option<String> {
        path.extension().map(|ext| ext.to_string_lossy().to_lowercase())
    }

    /// Classify a file by extension
    pub fn media_kind(path: &Path) -> Option<MediaKind> {
        let ext = Self::extension(path)?;
        match ext.as_str() {
            "mp4" | "avi" | "mkv" | "mov" | "webm" | "flv" | "wmv" | "m4v" => Some(MediaKind::Video),
            "srt" | "ass" | "ssa" | "vtt" | "sub" => Some(MediaKind::Subtitle),
            _ => None,
        }
    }

    /// Validate one input and return its size in bytes.
    ///
    /// Fails with `InvalidParameters` when the file is missing, is not a regular
    /// file, has the wrong media kind or exceeds `max_bytes`.
    pub async fn inspect_input(path: &Path, expected: MediaKind, max_bytes: u64) -> JobResult<u64> {
        if Self::media_kind(path) != Some(expected) {
            return Err(JobError::InvalidParameters(format!(
                "{} is not a supported {} file",
                path.display(),
                expected.label()
            )));
        }

        let metadata = fs::metadata(path).await.map_err(|e| {
            JobError::InvalidParameters(format!("cannot read input {}: {}", path.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(JobError::InvalidParameters(format!(
                "input {} is not a regular file",
                path.display()
            )));
        }

        let size = metadata.len();
        if size > max_bytes {
            return Err(JobError::InvalidParameters(format!(
                "input {} is {} which exceeds the {} limit",
                path.display(),
                Self::format_size(size),
                Self::format_size(max_bytes)
            )));
        }

        Ok(size)
    }

    /// Total size of all regular files below `dir`
    pub fn dir_size(dir: &Path) -> u64 {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }
}
