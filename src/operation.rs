//! # Operation Module
//!
//! Questo modulo trasforma i parametri testuali di una richiesta in operazioni tipizzate.
//!
//! ## Responsabilità:
//! - Definisce le enum chiuse per tipi di operazione, preset e modalità
//! - Valida i parametri per ogni `OperationKind` (chiavi ammesse, valori, numero input)
//! - Rifiuta ogni valore sconosciuto con `InvalidParameters`
//! - Unica eccezione: preset di ottimizzazione sconosciuto → `Balanced` con avviso esplicito
//!
//! ## Parametri per operazione:
//! - `thumbnail`: `time` (default `00:00:01`) oppure `count`
//! - `trim`: `start`, `end`
//! - `merge`: nessuno (almeno 2 input)
//! - `split`: `mode` (`duration` | `count`), `value`
//! - `optimize`: `preset` (`high` | `balanced` | `small` | `custom`), `crf`, `speed`
//! - `subtitle`: `mode` (`burn` | `soft` | `multi`), `languages`
//! - `screenshot`: `times` oppure `interval`
//!
//! ## Esempio:
//! ```ignore
//! let params = BTreeMap::from([("start".into(), "10".into()), ("end".into(), "5".into())]);
//! assert!(Operation::parse(OperationKind::Trim, &params, 1).is_err());
//! ```

use crate::error::{JobError, JobResult};
use crate::file_manager::MediaKind;
use crate::utils::parse_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upper bound for frames extracted by a single job
pub const MAX_FRAMES: usize = 100;

/// Thumbnail time used when the caller doesn't pick one
const DEFAULT_THUMBNAIL_TIME: f64 = 1.0;

/// Speed presets understood by libx264
const X264_SPEEDS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
];

/// Requested transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Thumbnail,
    Trim,
    Merge,
    Split,
    Optimize,
    Subtitle,
    Screenshot,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Thumbnail => "thumbnail",
            OperationKind::Trim => "trim",
            OperationKind::Merge => "merge",
            OperationKind::Split => "split",
            OperationKind::Optimize => "optimize",
            OperationKind::Subtitle => "subtitle",
            OperationKind::Screenshot => "screenshot",
        }
    }

    fn allowed_parameters(&self) -> &'static [&'static str] {
        match self {
            OperationKind::Thumbnail => &["time", "count"],
            OperationKind::Trim => &["start", "end"],
            OperationKind::Merge => &[],
            OperationKind::Split => &["mode", "value"],
            OperationKind::Optimize => &["preset", "crf", "speed"],
            OperationKind::Subtitle => &["mode", "languages"],
            OperationKind::Screenshot => &["times", "interval"],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "thumbnail" => Ok(OperationKind::Thumbnail),
            "trim" => Ok(OperationKind::Trim),
            "merge" => Ok(OperationKind::Merge),
            "split" => Ok(OperationKind::Split),
            "optimize" => Ok(OperationKind::Optimize),
            "subtitle" => Ok(OperationKind::Subtitle),
            "screenshot" => Ok(OperationKind::Screenshot),
            other => Err(JobError::InvalidParameters(format!("unknown operation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSpec {
    /// One frame at the given second
    At(f64),
    /// `n` frames spread evenly over the media duration
    Evenly(u32),
}

/// Size-based splitting is not offered: its intended semantics were never defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    ByDuration(f64),
    ByCount(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizePreset {
    High,
    Balanced,
    Small,
    Custom,
}

impl OptimizePreset {
    /// Fixed (crf, speed) pair; `Custom` has none
    pub fn quality_pair(&self) -> Option<(u8, &'static str)> {
        match self {
            OptimizePreset::High => Some((18, "slow")),
            OptimizePreset::Balanced => Some((23, "medium")),
            OptimizePreset::Small => Some((28, "fast")),
            OptimizePreset::Custom => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeSettings {
    pub preset: OptimizePreset,
    pub crf: u8,
    pub speed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleMode {
    /// Render captions into the picture (re-encodes video)
    Burn,
    /// Attach one subtitle stream
    Soft,
    /// Attach several subtitle streams
    Multi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotSelection {
    Times(Vec<f64>),
    Interval(f64),
    Middle,
}

/// Fully validated transformation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Thumbnail { spec: ThumbnailSpec },
    Trim { start: f64, end: f64 },
    Merge,
    Split { mode: SplitMode },
    Optimize { settings: OptimizeSettings },
    Subtitle { mode: SubtitleMode, languages: Vec<String> },
    Screenshot { selection: ScreenshotSelection },
}

/// Result of validation: the operation plus remarks the caller must see
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOperation {
    pub operation: Operation,
    pub notices: Vec<String>,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Thumbnail { .. } => OperationKind::Thumbnail,
            Operation::Trim { .. } => OperationKind::Trim,
            Operation::Merge => OperationKind::Merge,
            Operation::Split { .. } => OperationKind::Split,
            Operation::Optimize { .. } => OperationKind::Optimize,
            Operation::Subtitle { .. } => OperationKind::Subtitle,
            Operation::Screenshot { .. } => OperationKind::Screenshot,
        }
    }

    /// Whether planning this operation requires the probed media duration
    pub fn needs_duration(&self) -> bool {
        matches!(
            self,
            Operation::Thumbnail { spec: ThumbnailSpec::Evenly(_) }
                | Operation::Split { mode: SplitMode::ByCount(_) }
                | Operation::Screenshot { selection: ScreenshotSelection::Interval(_) }
                | Operation::Screenshot { selection: ScreenshotSelection::Middle }
        )
    }

    /// Media kind expected for each input position
    pub fn expected_input_kinds(&self, input_count: usize) -> Vec<MediaKind> {
        (0..input_count)
            .map(|i| match self {
                Operation::Subtitle { .. } if i > 0 => MediaKind::Subtitle,
                _ => MediaKind::Video,
            })
            .collect()
    }

    /// Validate raw parameters for `kind` against `input_count` inputs
    pub fn parse(
        kind: OperationKind,
        params: &BTreeMap<String, String>,
        input_count: usize,
    ) -> JobResult<ValidatedOperation> {
        let allowed = kind.allowed_parameters();
        if let Some(unknown) = params.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(invalid(format!("parameter '{}' is not accepted by {}", unknown, kind)));
        }

        if input_count == 0 {
            return Err(invalid(format!("{} needs at least one input", kind)));
        }

        let mut notices = Vec::new();
        let operation = match kind {
            OperationKind::Thumbnail => {
                expect_single_input(kind, input_count)?;
                parse_thumbnail(params)?
            }
            OperationKind::Trim => {
                expect_single_input(kind, input_count)?;
                parse_trim(params)?
            }
            OperationKind::Merge => {
                if input_count < 2 {
                    return Err(invalid(format!(
                        "merge needs at least 2 inputs, got {}",
                        input_count
                    )));
                }
                Operation::Merge
            }
            OperationKind::Split => {
                expect_single_input(kind, input_count)?;
                parse_split(params)?
            }
            OperationKind::Optimize => {
                expect_single_input(kind, input_count)?;
                parse_optimize(params, &mut notices)?
            }
            OperationKind::Subtitle => parse_subtitle(params, input_count)?,
            OperationKind::Screenshot => {
                expect_single_input(kind, input_count)?;
                parse_screenshot(params, &mut notices)?
            }
        };

        Ok(ValidatedOperation { operation, notices })
    }
}

fn invalid(message: String) -> JobError {
    JobError::InvalidParameters(message)
}

fn expect_single_input(kind: OperationKind, input_count: usize) -> JobResult<()> {
    if input_count != 1 {
        return Err(invalid(format!("{} takes exactly one input, got {}", kind, input_count)));
    }
    Ok(())
}

fn timestamp_param(params: &BTreeMap<String, String>, key: &str) -> JobResult<Option<f64>> {
    params
        .get(key)
        .map(|raw| {
            parse_timestamp(raw).ok_or_else(|| invalid(format!("{} '{}' is not a valid timestamp", key, raw)))
        })
        .transpose()
}

fn required_timestamp(params: &BTreeMap<String, String>, key: &str) -> JobResult<f64> {
    timestamp_param(params, key)?.ok_or_else(|| invalid(format!("missing parameter '{}'", key)))
}

fn count_param(params: &BTreeMap<String, String>, key: &str, min: u32) -> JobResult<Option<u32>> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{} '{}' is not a whole number", key, raw)))?;
    if value < min || value as usize > MAX_FRAMES {
        return Err(invalid(format!("{} must be between {} and {}", key, min, MAX_FRAMES)));
    }
    Ok(Some(value))
}

fn parse_thumbnail(params: &BTreeMap<String, String>) -> JobResult<Operation> {
    let time = timestamp_param(params, "time")?;
    let count = count_param(params, "count", 1)?;

    let spec = match (time, count) {
        (Some(_), Some(_)) => return Err(invalid("thumbnail accepts either 'time' or 'count', not both".into())),
        (_, Some(n)) => ThumbnailSpec::Evenly(n),
        (Some(t), None) => ThumbnailSpec::At(t),
        (None, None) => ThumbnailSpec::At(DEFAULT_THUMBNAIL_TIME),
    };
    Ok(Operation::Thumbnail { spec })
}

fn parse_trim(params: &BTreeMap<String, String>) -> JobResult<Operation> {
    let start = required_timestamp(params, "start")?;
    let end = required_timestamp(params, "end")?;
    if end <= start {
        return Err(invalid(format!("trim end ({}) must be after start ({})", end, start)));
    }
    Ok(Operation::Trim { start, end })
}

fn parse_split(params: &BTreeMap<String, String>) -> JobResult<Operation> {
    let mode = params
        .get("mode")
        .ok_or_else(|| invalid("missing parameter 'mode'".into()))?;
    let value = params
        .get("value")
        .ok_or_else(|| invalid("missing parameter 'value'".into()))?;

    let mode = match mode.trim().to_lowercase().as_str() {
        "duration" => {
            let seconds = parse_timestamp(value)
                .filter(|s| *s > 0.0)
                .ok_or_else(|| invalid(format!("segment duration '{}' must be a positive timestamp", value)))?;
            SplitMode::ByDuration(seconds)
        }
        "count" => {
            let count = count_param(params, "value", 2)?.unwrap_or_default();
            SplitMode::ByCount(count)
        }
        "size" => {
            return Err(invalid(
                "split by size is not supported; use mode=duration or mode=count".into(),
            ))
        }
        other => return Err(invalid(format!("unknown split mode '{}'", other))),
    };
    Ok(Operation::Split { mode })
}

fn parse_optimize(params: &BTreeMap<String, String>, notices: &mut Vec<String>) -> JobResult<Operation> {
    let preset = match params.get("preset").map(|p| p.trim().to_lowercase()) {
        None => OptimizePreset::Balanced,
        Some(p) => match p.as_str() {
            "high" => OptimizePreset::High,
            "balanced" => OptimizePreset::Balanced,
            "small" => OptimizePreset::Small,
            "custom" => OptimizePreset::Custom,
            other => {
                notices.push(format!("unknown optimize preset '{}', using balanced", other));
                OptimizePreset::Balanced
            }
        },
    };

    let crf = params.get("crf");
    let speed = params.get("speed");

    let settings = match preset.quality_pair() {
        Some((crf_value, speed_value)) => {
            if crf.is_some() || speed.is_some() {
                return Err(invalid("'crf' and 'speed' are only accepted with preset=custom".into()));
            }
            OptimizeSettings {
                preset,
                crf: crf_value,
                speed: speed_value.to_string(),
            }
        }
        None => {
            let crf = crf.ok_or_else(|| invalid("preset=custom requires 'crf'".into()))?;
            let speed = speed.ok_or_else(|| invalid("preset=custom requires 'speed'".into()))?;
            let crf: u8 = crf
                .trim()
                .parse()
                .ok()
                .filter(|c| *c <= 51)
                .ok_or_else(|| invalid(format!("crf '{}' must be between 0 and 51", crf)))?;
            let speed = speed.trim().to_lowercase();
            if !X264_SPEEDS.contains(&speed.as_str()) {
                return Err(invalid(format!("unknown speed '{}'", speed)));
            }
            OptimizeSettings { preset, crf, speed }
        }
    };
    Ok(Operation::Optimize { settings })
}

fn parse_subtitle(params: &BTreeMap<String, String>, input_count: usize) -> JobResult<Operation> {
    let mode = match params.get("mode").map(|m| m.trim().to_lowercase()).as_deref() {
        Some("burn") => SubtitleMode::Burn,
        Some("soft") => SubtitleMode::Soft,
        Some("multi") => SubtitleMode::Multi,
        Some(other) => return Err(invalid(format!("unknown subtitle mode '{}'", other))),
        None => return Err(invalid("missing parameter 'mode'".into())),
    };

    let tracks = input_count - 1;
    match mode {
        SubtitleMode::Burn | SubtitleMode::Soft if tracks != 1 => {
            return Err(invalid("burn and soft subtitles take one video and one subtitle file".into()))
        }
        SubtitleMode::Multi if tracks < 2 => {
            return Err(invalid("multi subtitles take one video and at least two subtitle files".into()))
        }
        _ => {}
    }

    let languages: Vec<String> = match params.get("languages") {
        None => Vec::new(),
        Some(raw) => raw.split(',').map(|l| l.trim().to_lowercase()).collect(),
    };
    if !languages.is_empty() {
        if mode == SubtitleMode::Burn {
            return Err(invalid("'languages' has no effect on burned subtitles".into()));
        }
        if languages.len() != tracks {
            return Err(invalid(format!(
                "got {} languages for {} subtitle tracks",
                languages.len(),
                tracks
            )));
        }
        if let Some(bad) = languages
            .iter()
            .find(|l| !(2..=3).contains(&l.len()) || !l.chars().all(|c| c.is_ascii_lowercase()))
        {
            return Err(invalid(format!("'{}' is not a language code", bad)));
        }
    }

    Ok(Operation::Subtitle { mode, languages })
}

fn parse_screenshot(params: &BTreeMap<String, String>, notices: &mut Vec<String>) -> JobResult<Operation> {
    if let Some(raw) = params.get("times") {
        let times = raw
            .split(',')
            .map(|t| parse_timestamp(t).ok_or_else(|| invalid(format!("'{}' is not a valid timestamp", t.trim()))))
            .collect::<JobResult<Vec<f64>>>()?;
        if times.len() > MAX_FRAMES {
            return Err(invalid(format!("at most {} screenshot times are allowed", MAX_FRAMES)));
        }
        if params.contains_key("interval") {
            notices.push("both 'times' and 'interval' given; using 'times'".to_string());
        }
        return Ok(Operation::Screenshot {
            selection: ScreenshotSelection::Times(times),
        });
    }

    if let Some(interval) = timestamp_param(params, "interval")? {
        if interval <= 0.0 {
            return Err(invalid("screenshot interval must be positive".into()));
        }
        return Ok(Operation::Screenshot {
            selection: ScreenshotSelection::Interval(interval),
        });
    }

    Ok(Operation::Screenshot {
        selection: ScreenshotSelection::Middle,
    })
}
