//! Pure mapping from a validated operation to the tool invocations that perform it.

use super::ToolInvocation;
use crate::args;
use crate::error::{JobError, JobResult};
use crate::file_manager::FileManager;
use crate::operation::{
    Operation, OptimizeSettings, ScreenshotSelection, SplitMode, SubtitleMode, ThumbnailSpec, MAX_FRAMES,
};
use crate::utils::{format_seconds, require_utf8};
use std::path::{Path, PathBuf};
use std::time::Duration;

const AUDIO_BITRATE: &str = "128k";

/// Everything `plan` needs besides the operation
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub inputs: &'a [PathBuf],
    pub workspace: &'a Path,
    pub ffmpeg: &'a str,
    pub timeout: Duration,
    /// Probed duration of the first input, when the operation needs it
    pub duration: Option<f64>,
}

/// File that must be written into the workspace before the first step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub path: PathBuf,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutputs {
    /// Exactly these files must exist after the last step
    Files(Vec<PathBuf>),
    /// Whatever files in `dir` start with `prefix`, sorted by name
    Segments { dir: PathBuf, prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub manifest: Option<Manifest>,
    pub steps: Vec<ToolInvocation>,
    pub outputs: ExpectedOutputs,
}

impl ExecutionPlan {
    fn single(step: ToolInvocation, output: PathBuf) -> Self {
        Self {
            manifest: None,
            steps: vec![step],
            outputs: ExpectedOutputs::Files(vec![output]),
        }
    }
}

/// Map an operation to its execution plan. Never touches the filesystem.
pub fn plan(operation: &Operation, ctx: &PlanContext<'_>) -> JobResult<ExecutionPlan> {
    let first = ctx
        .inputs
        .first()
        .ok_or_else(|| JobError::InternalInconsistency("planning a job without inputs".into()))?;
    // arguments are built with `display()`, lossless only for UTF-8 paths
    require_utf8(ctx.workspace)?;
    for input in ctx.inputs {
        require_utf8(input)?;
    }

    match operation {
        Operation::Thumbnail { spec: ThumbnailSpec::At(time) } => {
            let output = ctx.workspace.join("thumbnail.jpg");
            Ok(ExecutionPlan::single(frame_step(ctx, first, *time, &output), output))
        }
        Operation::Thumbnail { spec: ThumbnailSpec::Evenly(count) } => {
            let duration = required_duration(ctx)?;
            let n = *count as usize;
            let times = (0..n).map(|i| i as f64 * duration / n as f64).collect::<Vec<_>>();
            Ok(frames_plan(ctx, first, &times, "thumbnail"))
        }
        Operation::Trim { start, end } => {
            if end <= start {
                return Err(JobError::InvalidParameters(format!(
                    "trim end ({}) must be after start ({})",
                    end, start
                )));
            }
            let output = ctx.workspace.join(format!("trimmed.{}", container_of(first)));
            let step = ffmpeg(
                ctx,
                args![
                    "-ss",
                    format_seconds(*start),
                    "-to",
                    format_seconds(*end),
                    "-i",
                    first.display(),
                    "-c",
                    "copy",
                    output.display()
                ],
            );
            Ok(ExecutionPlan::single(step, output))
        }
        Operation::Merge => merge_plan(ctx, first),
        Operation::Split { mode } => {
            let segment_time = match mode {
                SplitMode::ByDuration(seconds) => *seconds,
                SplitMode::ByCount(count) => required_duration(ctx)? / *count as f64,
            };
            let pattern = ctx.workspace.join(format!("segment_%03d.{}", container_of(first)));
            let step = ffmpeg(
                ctx,
                args![
                    "-i",
                    first.display(),
                    "-map",
                    "0",
                    "-c",
                    "copy",
                    "-f",
                    "segment",
                    "-segment_time",
                    format_seconds(segment_time),
                    "-reset_timestamps",
                    "1",
                    pattern.display()
                ],
            );
            Ok(ExecutionPlan {
                manifest: None,
                steps: vec![step],
                outputs: ExpectedOutputs::Segments {
                    dir: ctx.workspace.to_path_buf(),
                    prefix: "segment_".to_string(),
                },
            })
        }
        Operation::Optimize { settings } => Ok(optimize_plan(ctx, first, settings)),
        Operation::Subtitle { mode, languages } => subtitle_plan(ctx, first, *mode, languages),
        Operation::Screenshot { selection } => {
            let times = match selection {
                ScreenshotSelection::Times(times) => times.clone(),
                ScreenshotSelection::Interval(interval) => {
                    let duration = required_duration(ctx)?;
                    let frames = (duration / interval).floor() as usize;
                    if frames == 0 {
                        return Err(JobError::InvalidParameters(format!(
                            "interval {}s yields no screenshots for a {:.1}s video",
                            interval, duration
                        )));
                    }
                    if frames > MAX_FRAMES {
                        return Err(JobError::InvalidParameters(format!(
                            "interval {}s yields {} screenshots, the limit is {}",
                            interval, frames, MAX_FRAMES
                        )));
                    }
                    (0..frames).map(|i| i as f64 * interval).collect()
                }
                ScreenshotSelection::Middle => {
                    let output = ctx.workspace.join("screenshot.jpg");
                    let middle = required_duration(ctx)? / 2.0;
                    return Ok(ExecutionPlan::single(frame_step(ctx, first, middle, &output), output));
                }
            };
            Ok(frames_plan(ctx, first, &times, "screenshot"))
        }
    }
}

fn ffmpeg(ctx: &PlanContext<'_>, mut tail: Vec<String>) -> ToolInvocation {
    let mut args = args!["-hide_banner", "-loglevel", "error", "-y"];
    args.append(&mut tail);
    ToolInvocation::new(ctx.ffmpeg, args, ctx.workspace).with_timeout(ctx.timeout)
}

fn required_duration(ctx: &PlanContext<'_>) -> JobResult<f64> {
    ctx.duration
        .ok_or_else(|| JobError::InternalInconsistency("operation planned without a probed duration".into()))
}

/// Output container: the input's extension, mp4 when it has none
fn container_of(input: &Path) -> String {
    FileManager::extension(input).unwrap_or_else(|| "mp4".to_string())
}

fn frame_step(ctx: &PlanContext<'_>, input: &Path, time: f64, output: &Path) -> ToolInvocation {
    ffmpeg(
        ctx,
        args![
            "-ss",
            format_seconds(time),
            "-i",
            input.display(),
            "-frames:v",
            "1",
            "-q:v",
            "2",
            output.display()
        ],
    )
}

/// One step per frame, named `<stem>_<n>.jpg` starting at 1
fn frames_plan(ctx: &PlanContext<'_>, input: &Path, times: &[f64], stem: &str) -> ExecutionPlan {
    let mut steps = Vec::with_capacity(times.len());
    let mut outputs = Vec::with_capacity(times.len());
    for (i, time) in times.iter().enumerate() {
        let output = ctx.workspace.join(format!("{}_{}.jpg", stem, i + 1));
        steps.push(frame_step(ctx, input, *time, &output));
        outputs.push(output);
    }
    ExecutionPlan {
        manifest: None,
        steps,
        outputs: ExpectedOutputs::Files(outputs),
    }
}

fn merge_plan(ctx: &PlanContext<'_>, first: &Path) -> JobResult<ExecutionPlan> {
    if ctx.inputs.len() < 2 {
        return Err(JobError::InvalidParameters(format!(
            "merge needs at least 2 inputs, got {}",
            ctx.inputs.len()
        )));
    }

    let contents: String = ctx
        .inputs
        .iter()
        .map(|input| format!("file '{}'\n", input.display().to_string().replace('\'', r"'\''")))
        .collect();
    let manifest = Manifest {
        path: ctx.workspace.join("concat.txt"),
        contents,
    };

    let output = ctx.workspace.join(format!("merged.{}", container_of(first)));
    let step = ffmpeg(
        ctx,
        args![
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            manifest.path.display(),
            "-c",
            "copy",
            output.display()
        ],
    );
    Ok(ExecutionPlan {
        manifest: Some(manifest),
        steps: vec![step],
        outputs: ExpectedOutputs::Files(vec![output]),
    })
}

fn optimize_plan(ctx: &PlanContext<'_>, input: &Path, settings: &OptimizeSettings) -> ExecutionPlan {
    let output = ctx.workspace.join("optimized.mp4");
    let step = ffmpeg(
        ctx,
        args![
            "-i",
            input.display(),
            "-c:v",
            "libx264",
            "-crf",
            settings.crf,
            "-preset",
            settings.speed,
            "-c:a",
            "aac",
            "-b:a",
            AUDIO_BITRATE,
            "-movflags",
            "+faststart",
            output.display()
        ],
    );
    ExecutionPlan::single(step, output)
}

/// Escape a path for use inside an ffmpeg filter argument
fn escape_filter_path(path: &Path) -> String {
    let mut escaped = String::new();
    for c in path.display().to_string().chars() {
        if matches!(c, '\\' | ':' | '\'' | ',' | '[' | ']' | ';') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn subtitle_plan(
    ctx: &PlanContext<'_>,
    video: &Path,
    mode: SubtitleMode,
    languages: &[String],
) -> JobResult<ExecutionPlan> {
    let tracks = &ctx.inputs[1..];
    let needed = match mode {
        SubtitleMode::Burn | SubtitleMode::Soft => tracks.len() == 1,
        SubtitleMode::Multi => tracks.len() >= 2,
    };
    if !needed {
        return Err(JobError::InvalidParameters(format!(
            "subtitle mode {:?} cannot use {} subtitle track(s)",
            mode,
            tracks.len()
        )));
    }

    if mode == SubtitleMode::Burn {
        let output = ctx.workspace.join(format!("subtitled.{}", container_of(video)));
        let filter = format!("subtitles={}", escape_filter_path(&tracks[0]));
        let step = ffmpeg(
            ctx,
            args!["-i", video.display(), "-vf", filter, "-c:a", "copy", output.display()],
        );
        return Ok(ExecutionPlan::single(step, output));
    }

    // mp4-family containers only carry mov_text subtitles
    let container = container_of(video);
    let (extension, subtitle_codec) = match container.as_str() {
        "mp4" | "mov" | "m4v" => (container.clone(), "mov_text"),
        _ => ("mkv".to_string(), "copy"),
    };
    let output = ctx.workspace.join(format!("subtitled.{}", extension));

    let mut args = args!["-i", video.display()];
    for track in tracks {
        args.extend(args!["-i", track.display()]);
    }
    args.extend(args!["-map", "0:v", "-map", "0:a?"]);
    for i in 0..tracks.len() {
        args.extend(args!["-map", i + 1]);
    }
    args.extend(args!["-c:v", "copy", "-c:a", "copy", "-c:s", subtitle_codec]);
    for (i, language) in languages.iter().enumerate() {
        args.extend(args![format!("-metadata:s:s:{}", i), format!("language={}", language)]);
    }
    args.push(output.display().to_string());

    Ok(ExecutionPlan::single(ffmpeg(ctx, args), output))
}
