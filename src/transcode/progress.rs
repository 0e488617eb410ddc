//! Parsing of the media tool's progress text
//!
//! ffmpeg reports progress on its error stream as status lines containing
//! `time=HH:MM:SS.cc`. Only the coarse out-time is extracted; codec
//! internals are never parsed.

use regex::Regex;
use std::sync::OnceLock;

// `expect` is acceptable here: the pattern is a compile-time constant
#[allow(clippy::expect_used)]
fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=(?:(\d+):)?(\d{1,2}):(\d{1,2}(?:\.\d+)?)")
            .expect("progress pattern is valid")
    })
}

/// Extract the out-time in seconds from one stderr status line
///
/// Returns `None` for lines without a time field, and for the `time=N/A`
/// placeholder ffmpeg prints before the first frame.
pub(super) fn parse_out_time_secs(line: &str) -> Option<f64> {
    let caps = time_regex().captures(line)?;
    let hours: f64 = caps
        .get(1)
        .map(|m| m.as_str().parse().unwrap_or(0.0))
        .unwrap_or(0.0);
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Heuristic for input-related failures in the tool's error output
///
/// Distinguishes `BadInput` (caller sent something unreadable) from
/// `ToolCrashed` (everything else).
pub(super) fn looks_like_bad_input(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Invalid data found when processing input",
        "moov atom not found",
        "Unknown format",
        "could not find codec parameters",
        "Invalid argument",
        "No such file or directory",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}
