//! # Utility Functions Module
//!
//! Small helpers shared by the invocation planner and parameter validation:
//! argument-vector construction and timestamp parsing/formatting.

use crate::error::{JobError, JobResult};
use std::path::Path;

/// Converts any iterable of displayable items into an argument vector.
///
/// # Example
/// ```rust
/// use media_job_engine::utils::to_string_vec;
///
/// let crf = 23;
/// let args = to_string_vec(["-crf", &crf.to_string(), "-y"]);
/// assert_eq!(args, vec!["-crf", "23", "-y"]);
/// ```
pub fn to_string_vec<T, I>(items: I) -> Vec<String>
where
    T: ToString,
    I: IntoIterator<Item = T>,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

/// Builds a `Vec<String>` of tool arguments from mixed literals and values.
///
/// ```rust
/// use media_job_engine::args;
///
/// let crf = 18;
/// let args = args!["-crf", crf, "-preset", "slow"];
/// assert_eq!(args[1], "18");
/// ```
#[macro_export]
macro_rules! args {
    [$($item:expr),* $(,)?] => {
        $crate::utils::to_string_vec([$($item.to_string()),*])
    };
}

/// Parse a timestamp given as seconds (`90`, `12.5`), `MM:SS` or `HH:MM:SS(.fff)`.
///
/// Returns `None` for negative, non-finite or malformed values.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let mut seconds = 0.0;
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        let parsed: f64 = if is_last {
            part.parse().ok()?
        } else {
            // Hours and minutes must be whole numbers
            part.parse::<u64>().ok()? as f64
        };
        if !parsed.is_finite() || parsed < 0.0 {
            return None;
        }
        // Minutes and seconds fields are bounded when a larger unit precedes them
        if i > 0 && parsed >= 60.0 {
            return None;
        }
        seconds = seconds * 60.0 + parsed;
    }

    Some(seconds)
}

/// Format seconds the way ffmpeg accepts them on the command line
pub fn format_seconds(seconds: f64) -> String {
    format!("{:.3}", seconds)
}

/// Tool arguments are strings; a path that isn't valid UTF-8 cannot be passed unchanged
pub fn require_utf8(path: &Path) -> JobResult<&str> {
    path.to_str().ok_or_else(|| {
        JobError::InvalidParameters(format!("path is not valid UTF-8: {}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_vec_mixed_types() {
        let num = 42;
        let result = to_string_vec(["-crf", &num.to_string(), "-y"]);
        assert_eq!(result, vec!["-crf".to_string(), "42".to_string(), "-y".to_string()]);
    }

    #[test]
    fn test_args_macro_accepts_values() {
        let crf = 28;
        let result = args!["-crf", crf, "-preset", "fast"];
        assert_eq!(result, vec!["-crf", "28", "-preset", "fast"]);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("90"), Some(90.0));
        assert_eq!(parse_timestamp("12.5"), Some(12.5));
        assert_eq!(parse_timestamp("01:30"), Some(90.0));
        assert_eq!(parse_timestamp("00:01:30"), Some(90.0));
        assert_eq!(parse_timestamp("01:00:00.5"), Some(3600.5));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("-3"), None);
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("00:75:00"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
        assert_eq!(parse_timestamp("inf"), None);
    }

    #[test]
    fn test_require_utf8() {
        assert_eq!(require_utf8(Path::new("/in/clip.mp4")).unwrap(), "/in/clip.mp4");
    }

    #[cfg(unix)]
    #[test]
    fn test_require_utf8_rejects_invalid_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/in/clip\xff.mp4"));
        assert!(matches!(require_utf8(path), Err(JobError::InvalidParameters(_))));
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(47.5), "47.500");
        assert_eq!(format_seconds(0.0), "0.000");
    }
}
