//! Transcoder adapter — scoped invocation of the external media tool
//!
//! The media tool (ffmpeg) runs as an isolated child process with a hard
//! deadline derived from the input size. Its error stream is parsed into
//! coarse progress snapshots; on every exit path — success, failure,
//! timeout, cancellation — the process is terminated and reaped.
//!
//! Split into focused submodules:
//! - [`command`] - argument builders per media profile
//! - [`progress`] - error-stream progress and diagnostic parsing

mod command;
mod progress;

pub use command::is_passthrough;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::config::TranscodeConfig;
use crate::error::TranscodeError;
use crate::fetch::ProgressGate;
use crate::staging::StagedFile;
use crate::types::{JobId, Phase, ProgressSnapshot};

/// How much of the tool's error stream to keep for diagnostics
const STDERR_TAIL_BYTES: usize = 2048;

/// Target audio container/codec family for extraction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// MPEG layer 3
    Mp3,
    /// Ogg Vorbis
    Ogg,
    /// Uncompressed PCM WAV
    Wav,
}

impl AudioFormat {
    /// Container name passed to the tool's `-f` flag
    pub fn container(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Wav => "wav",
        }
    }
}

/// Normalization profile applied by the transcode phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum MediaProfile {
    /// Re-encode video to 1280x720, capped at 2000k
    Video720p,
    /// Re-encode video to 854x480, capped at 1000k
    Video480p,
    /// Re-encode video to 640x360, capped at 500k
    Video360p,
    /// Extract the audio track
    AudioExtract {
        /// Output format
        format: AudioFormat,
        /// Target bitrate (e.g. "192k")
        bitrate: String,
    },
    /// Repackage streams into an mp4 container without re-encoding
    Remux,
}

impl MediaProfile {
    /// Extension of the file this profile produces
    pub fn output_extension(&self) -> &'static str {
        match self {
            MediaProfile::Video720p
            | MediaProfile::Video480p
            | MediaProfile::Video360p
            | MediaProfile::Remux => "mp4",
            MediaProfile::AudioExtract { format, .. } => format.container(),
        }
    }
}

/// One transcode invocation
///
/// Exists only for the lifetime of the invocation and is owned by the
/// adapter; the coordinator builds it from the staged input and the job's
/// requested profile.
#[derive(Clone, Debug)]
pub struct TranscodeSpec {
    /// Staged input path
    pub input: PathBuf,
    /// Output path inside the same staging slot
    pub output: PathBuf,
    /// Normalization profile
    pub profile: MediaProfile,
    /// Use the relaxed (faster, lower-quality) variant
    pub relaxed: bool,
}

/// Invokes the external media tool as a bounded child process
#[derive(Clone, Debug)]
pub struct Transcoder {
    config: TranscodeConfig,
}

impl Transcoder {
    /// Create a transcoder with the given tool configuration
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    /// Resolve the ffmpeg binary from config or PATH
    fn resolve_ffmpeg(&self) -> Result<PathBuf, TranscodeError> {
        if let Some(path) = &self.config.ffmpeg_path {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(TranscodeError::ToolMissing {
                tool: path.display().to_string(),
            });
        }
        if self.config.search_path {
            return which::which("ffmpeg").map_err(|_| TranscodeError::ToolMissing {
                tool: "ffmpeg".to_string(),
            });
        }
        Err(TranscodeError::ToolMissing {
            tool: "ffmpeg".to_string(),
        })
    }

    /// Resolve the ffprobe binary, best-effort (progress works without it)
    fn resolve_ffprobe(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config.ffprobe_path {
            return path.is_file().then(|| path.clone());
        }
        if self.config.search_path {
            return which::which("ffprobe").ok();
        }
        None
    }

    /// Hard deadline for an invocation, scaled by input size
    pub fn deadline_for(&self, input_bytes: u64) -> Duration {
        let gib = input_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        self.config.base_timeout
            + Duration::from_secs_f64(self.config.timeout_per_gib.as_secs_f64() * gib)
    }

    /// Probe the input duration in seconds for progress percentage mapping
    async fn probe_duration_secs(&self, input: &std::path::Path) -> Option<f64> {
        let ffprobe = self.resolve_ffprobe()?;
        let output = Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| *d > 0.0)
    }

    /// Run the media tool for one [`TranscodeSpec`]
    ///
    /// Emits phase=transcode progress snapshots (when the input duration is
    /// probeable) and returns the staged output file. The child is
    /// guaranteed terminated and reaped on every exit path: timeout and
    /// cancellation send a polite termination signal, wait out the
    /// configured grace period, then kill; an aborted future falls back to
    /// `kill_on_drop`.
    pub async fn transcode(
        &self,
        spec: &TranscodeSpec,
        job_id: JobId,
        progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<StagedFile, TranscodeError> {
        let ffmpeg = self.resolve_ffmpeg()?;
        let input_meta =
            tokio::fs::metadata(&spec.input)
                .await
                .map_err(|e| TranscodeError::BadInput {
                    message: format!("input not readable: {e}"),
                })?;
        let input_bytes = input_meta.len();
        let duration_secs = self.probe_duration_secs(&spec.input).await;
        let deadline = self.deadline_for(input_bytes);

        tracing::info!(
            job_id = job_id.0,
            tool = %ffmpeg.display(),
            profile = ?spec.profile,
            relaxed = spec.relaxed,
            input_bytes,
            deadline_secs = deadline.as_secs(),
            "Starting transcode"
        );

        let mut child = Command::new(&ffmpeg)
            .args(command::build_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TranscodeError::ToolMissing {
                    tool: ffmpeg.display().to_string(),
                },
                _ => TranscodeError::ToolCrashed {
                    exit_code: None,
                    stderr_tail: format!("failed to spawn media tool: {e}"),
                },
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::ToolCrashed {
                exit_code: None,
                stderr_tail: "media tool stderr was not captured".to_string(),
            })?;

        // Pump stderr to EOF (which tracks process lifetime) under both the
        // hard deadline and the cancellation token
        let started = std::time::Instant::now();
        let pump = pump_stderr(stderr, job_id, input_bytes, duration_secs, progress_tx);
        let stderr_tail = tokio::select! {
            pumped = tokio::time::timeout(deadline, pump) => match pumped {
                Ok(tail) => tail?,
                Err(_) => {
                    terminate_child(&mut child, self.config.kill_grace).await;
                    return Err(TranscodeError::Timeout {
                        seconds: deadline.as_secs(),
                    });
                }
            },
            _ = cancel.cancelled() => {
                terminate_child(&mut child, self.config.kill_grace).await;
                return Err(TranscodeError::ToolCrashed {
                    exit_code: None,
                    stderr_tail: "terminated by cancellation".to_string(),
                });
            }
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        let status = match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(TranscodeError::ToolCrashed {
                    exit_code: None,
                    stderr_tail: format!("failed to reap media tool: {e}"),
                });
            }
            Err(_) => {
                terminate_child(&mut child, self.config.kill_grace).await;
                return Err(TranscodeError::Timeout {
                    seconds: deadline.as_secs(),
                });
            }
        };

        if !status.success() {
            if progress::looks_like_bad_input(&stderr_tail) {
                return Err(TranscodeError::BadInput {
                    message: last_line(&stderr_tail),
                });
            }
            return Err(TranscodeError::ToolCrashed {
                exit_code: status.code(),
                stderr_tail: last_line(&stderr_tail),
            });
        }

        let output_meta =
            tokio::fs::metadata(&spec.output)
                .await
                .map_err(|e| TranscodeError::ToolCrashed {
                    exit_code: status.code(),
                    stderr_tail: format!("tool reported success but output is missing: {e}"),
                })?;

        // Final snapshot at 100% of the input size
        let _ = progress_tx
            .send(ProgressSnapshot::now(
                job_id,
                Phase::Transcode,
                input_bytes,
                Some(input_bytes),
            ))
            .await;

        tracing::info!(
            job_id = job_id.0,
            output_bytes = output_meta.len(),
            path = %spec.output.display(),
            "Transcode finished"
        );

        Ok(StagedFile {
            path: spec.output.clone(),
            size_bytes: output_meta.len(),
        })
    }
}

/// Pump the child's error stream to EOF, emitting throttled progress.
///
/// Returns the retained stderr tail. EOF tracks process lifetime: ffmpeg
/// keeps stderr open until it exits, so the caller's deadline on this
/// future bounds the whole invocation.
async fn pump_stderr(
    mut stderr: tokio::process::ChildStderr,
    job_id: JobId,
    input_bytes: u64,
    duration_secs: Option<f64>,
    progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
) -> Result<String, TranscodeError> {
    let mut gate = ProgressGate::new(Duration::from_secs(2), 1.0);
    let mut tail: Vec<u8> = Vec::with_capacity(STDERR_TAIL_BYTES);
    let mut line_buf = String::new();
    let mut read_buf = [0u8; 4096];

    loop {
        let n = stderr
            .read(&mut read_buf)
            .await
            .map_err(|e| TranscodeError::ToolCrashed {
                exit_code: None,
                stderr_tail: format!("failed reading media tool output: {e}"),
            })?;
        if n == 0 {
            break;
        }

        tail.extend_from_slice(&read_buf[..n]);
        if tail.len() > STDERR_TAIL_BYTES {
            let excess = tail.len() - STDERR_TAIL_BYTES;
            tail.drain(..excess);
        }

        // Status lines are terminated with \r, diagnostics with \n
        line_buf.push_str(&String::from_utf8_lossy(&read_buf[..n]));
        while let Some(pos) = line_buf.find(['\r', '\n']) {
            let line: String = line_buf.drain(..=pos).collect();
            if let (Some(out_secs), Some(total_secs)) =
                (progress::parse_out_time_secs(&line), duration_secs)
            {
                let fraction = (out_secs / total_secs).min(1.0);
                let bytes_done = (fraction * input_bytes as f64) as u64;
                if gate.should_emit(bytes_done, Some(input_bytes)) {
                    let _ = progress_tx
                        .send(ProgressSnapshot::now(
                            job_id,
                            Phase::Transcode,
                            bytes_done,
                            Some(input_bytes),
                        ))
                        .await;
                }
            }
        }
    }

    Ok(String::from_utf8_lossy(&tail).into_owned())
}

/// Terminate a child: polite signal first, forced kill after the grace period.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: sending SIGTERM to a pid we own; failure is handled by the
        // forced kill below.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "Media tool ignored termination signal, killing");
    }

    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
}

/// Last non-empty line of a diagnostic blob
fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn no_tool_config() -> TranscodeConfig {
        TranscodeConfig {
            ffmpeg_path: None,
            ffprobe_path: None,
            search_path: false,
            base_timeout: Duration::from_secs(300),
            timeout_per_gib: Duration::from_secs(120),
            kill_grace: Duration::from_millis(100),
        }
    }

    #[test]
    fn deadline_scales_with_input_size() {
        let transcoder = Transcoder::new(no_tool_config());
        let base = transcoder.deadline_for(0);
        assert_eq!(base, Duration::from_secs(300));

        let one_gib = transcoder.deadline_for(1024 * 1024 * 1024);
        assert_eq!(one_gib, Duration::from_secs(420));

        let two_gib = transcoder.deadline_for(2 * 1024 * 1024 * 1024);
        assert_eq!(two_gib, Duration::from_secs(540));
    }

    #[test]
    fn missing_tool_is_reported_when_path_search_disabled() {
        let transcoder = Transcoder::new(no_tool_config());
        let err = transcoder.resolve_ffmpeg().unwrap_err();
        assert!(matches!(err, TranscodeError::ToolMissing { .. }));
    }

    #[test]
    fn configured_path_must_exist() {
        let mut config = no_tool_config();
        config.ffmpeg_path = Some(PathBuf::from("/nonexistent/ffmpeg"));
        let transcoder = Transcoder::new(config);
        let err = transcoder.resolve_ffmpeg().unwrap_err();
        match err {
            TranscodeError::ToolMissing { tool } => {
                assert!(tool.contains("/nonexistent/ffmpeg"));
            }
            other => panic!("expected ToolMissing, got {other}"),
        }
    }

    #[test]
    fn output_extension_follows_profile() {
        assert_eq!(MediaProfile::Video720p.output_extension(), "mp4");
        assert_eq!(MediaProfile::Remux.output_extension(), "mp4");
        assert_eq!(
            MediaProfile::AudioExtract {
                format: AudioFormat::Ogg,
                bitrate: "160k".into()
            }
            .output_extension(),
            "ogg"
        );
    }

    #[test]
    fn last_line_skips_trailing_blanks() {
        assert_eq!(last_line("first\nsecond\n\n"), "second");
        assert_eq!(last_line(""), "");
    }

    // -----------------------------------------------------------------------
    // Subprocess behavior via stub tool scripts (Unix only)
    // -----------------------------------------------------------------------

    #[cfg(unix)]
    mod stub_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable stub script standing in for the media tool.
        fn write_stub(dir: &std::path::Path, body: &str) -> PathBuf {
            let path = dir.join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn stub_config(tool: PathBuf) -> TranscodeConfig {
            TranscodeConfig {
                ffmpeg_path: Some(tool),
                ffprobe_path: None,
                search_path: false,
                base_timeout: Duration::from_secs(10),
                timeout_per_gib: Duration::from_secs(0),
                kill_grace: Duration::from_millis(100),
            }
        }

        fn spec_in(dir: &std::path::Path) -> TranscodeSpec {
            let input = dir.join("in.mkv");
            std::fs::write(&input, vec![0u8; 1024]).unwrap();
            TranscodeSpec {
                input,
                output: dir.join("out.mp4"),
                profile: MediaProfile::Video480p,
                relaxed: false,
            }
        }

        #[tokio::test]
        async fn successful_tool_run_returns_staged_output() {
            let temp = tempfile::tempdir().unwrap();
            // The output path is the stub's last argument
            let tool = write_stub(
                temp.path(),
                r#"for last; do :; done
printf 'encoded' > "$last"
exit 0"#,
            );
            let transcoder = Transcoder::new(stub_config(tool));
            let spec = spec_in(temp.path());
            let (tx, _rx) = tokio::sync::mpsc::channel(16);

            let staged = transcoder
                .transcode(&spec, JobId::new(1), &tx, &tokio_util::sync::CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(staged.path, spec.output);
            assert_eq!(staged.size_bytes, 7);
        }

        #[tokio::test]
        async fn nonzero_exit_maps_to_tool_crashed_with_stderr_tail() {
            let temp = tempfile::tempdir().unwrap();
            let tool = write_stub(
                temp.path(),
                r#"echo "x264 [error]: something exploded" >&2
exit 1"#,
            );
            let transcoder = Transcoder::new(stub_config(tool));
            let spec = spec_in(temp.path());
            let (tx, _rx) = tokio::sync::mpsc::channel(16);

            let err = transcoder
                .transcode(&spec, JobId::new(1), &tx, &tokio_util::sync::CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                TranscodeError::ToolCrashed {
                    exit_code,
                    stderr_tail,
                } => {
                    assert_eq!(exit_code, Some(1));
                    assert!(stderr_tail.contains("something exploded"));
                }
                other => panic!("expected ToolCrashed, got {other}"),
            }
        }

        #[tokio::test]
        async fn input_diagnostics_map_to_bad_input() {
            let temp = tempfile::tempdir().unwrap();
            let tool = write_stub(
                temp.path(),
                r#"echo "in.mkv: Invalid data found when processing input" >&2
exit 1"#,
            );
            let transcoder = Transcoder::new(stub_config(tool));
            let spec = spec_in(temp.path());
            let (tx, _rx) = tokio::sync::mpsc::channel(16);

            let err = transcoder
                .transcode(&spec, JobId::new(1), &tx, &tokio_util::sync::CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::BadInput { .. }), "got {err}");
        }

        #[tokio::test]
        async fn hung_tool_hits_deadline_and_is_terminated() {
            let temp = tempfile::tempdir().unwrap();
            let tool = write_stub(temp.path(), "sleep 30");
            let mut config = stub_config(tool);
            config.base_timeout = Duration::from_millis(300);
            let transcoder = Transcoder::new(config);
            let spec = spec_in(temp.path());
            let (tx, _rx) = tokio::sync::mpsc::channel(16);

            let started = std::time::Instant::now();
            let err = transcoder
                .transcode(&spec, JobId::new(1), &tx, &tokio_util::sync::CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::Timeout { .. }), "got {err}");
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "termination must not wait for the tool to finish"
            );
        }

        #[tokio::test]
        async fn cancellation_terminates_the_tool_within_grace() {
            let temp = tempfile::tempdir().unwrap();
            let tool = write_stub(temp.path(), "sleep 30");
            let transcoder = Transcoder::new(stub_config(tool));
            let spec = spec_in(temp.path());
            let (tx, _rx) = tokio::sync::mpsc::channel(16);
            let cancel = tokio_util::sync::CancellationToken::new();

            let cancel_trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel_trigger.cancel();
            });

            let started = std::time::Instant::now();
            let result = transcoder.transcode(&spec, JobId::new(1), &tx, &cancel).await;
            assert!(result.is_err(), "cancelled transcode must not succeed");
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "cancellation must terminate the tool promptly, took {:?}",
                started.elapsed()
            );
        }

        #[tokio::test]
        async fn missing_output_despite_success_is_reported() {
            let temp = tempfile::tempdir().unwrap();
            let tool = write_stub(temp.path(), "exit 0");
            let transcoder = Transcoder::new(stub_config(tool));
            let spec = spec_in(temp.path());
            let (tx, _rx) = tokio::sync::mpsc::channel(16);

            let err = transcoder
                .transcode(&spec, JobId::new(1), &tx, &tokio_util::sync::CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::ToolCrashed { .. }), "got {err}");
        }
    }
}
