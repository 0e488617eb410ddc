//! Configuration types for media-relay
//!
//! Platform chunk sizes, pool sizes, retry counts, and timeouts are all
//! configuration with documented defaults, never hard-coded at use sites.

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Staging area configuration
///
/// Each job receives an exclusive subdirectory under `root_dir` for the
/// lifetime of its transfer; it is purged when the job reaches a terminal
/// state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root directory for per-job staging slots (default: "./staging")
    #[serde(default = "default_staging_root")]
    pub root_dir: PathBuf,

    /// Check free space before admitting a fetch (default: true)
    #[serde(default = "default_true")]
    pub check_free_space: bool,

    /// Minimum free space to keep in reserve, in bytes (default: 512 MiB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    /// Multiplier applied to the expected size when checking space
    /// (default: 2.5 — source plus transcoded output plus slack)
    #[serde(default = "default_size_multiplier")]
    pub size_multiplier: f64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root_dir: default_staging_root(),
            check_free_space: true,
            min_free_space: default_min_free_space(),
            size_multiplier: default_size_multiplier(),
        }
    }
}

/// Source fetcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum source file size in bytes (default: 2 GiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// TCP connect timeout (default: 15 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Idle timeout between body chunks (default: 60 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// Minimum interval between progress snapshots (default: 2 seconds)
    #[serde(default = "default_progress_interval", with = "duration_serde")]
    pub progress_interval: Duration,

    /// Minimum percent advance between progress snapshots when the total
    /// size is known (default: 1.0)
    #[serde(default = "default_progress_percent_step")]
    pub progress_percent_step: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            progress_interval: default_progress_interval(),
            progress_percent_step: default_progress_percent_step(),
        }
    }
}

/// Transcoder adapter configuration (external media tool)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Path to the ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to the ffprobe executable (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Whether to search PATH for the tools if explicit paths are not set
    /// (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Base hard timeout for a transcode invocation (default: 300 seconds)
    #[serde(default = "default_transcode_base_timeout", with = "duration_serde")]
    pub base_timeout: Duration,

    /// Additional timeout granted per GiB of input (default: 120 seconds)
    #[serde(default = "default_transcode_timeout_per_gib", with = "duration_serde")]
    pub timeout_per_gib: Duration,

    /// Grace period between the termination signal and a forced kill
    /// (default: 5 seconds)
    #[serde(default = "default_kill_grace", with = "duration_serde")]
    pub kill_grace: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            search_path: true,
            base_timeout: default_transcode_base_timeout(),
            timeout_per_gib: default_transcode_timeout_per_gib(),
            kill_grace: default_kill_grace(),
        }
    }
}

/// Chunked transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Platform part-size limit in bytes; the chunk plan is computed against
    /// this (default: 2_000_000_000)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Maximum chunks in flight at once (default: 4, respects platform rate
    /// limits)
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    /// Per-chunk retry policy for transient transport errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Resumable chunk-token cache (opt-in)
    #[serde(default)]
    pub token_cache: TokenCacheConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_parallel_chunks: default_max_parallel_chunks(),
            retry: RetryConfig::default(),
            token_cache: TokenCacheConfig::default(),
        }
    }
}

/// Resumable chunk-token cache configuration
///
/// Whether chunk tokens may be reused across upload attempts depends on the
/// platform protocol; this is an explicit opt-in, disabled by default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenCacheConfig {
    /// Enable the in-process token cache (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Retention window for cached tokens (default: 24 hours)
    #[serde(default = "default_token_retention", with = "duration_serde")]
    pub retention: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention: default_token_retention(),
        }
    }
}

/// Per-owner concurrency and cancellation limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrently running jobs per owner (default: 2)
    #[serde(default = "default_max_jobs_per_owner")]
    pub max_jobs_per_owner: usize,

    /// Maximum queued (not yet admitted) jobs per owner (default: 8)
    #[serde(default = "default_max_queued_per_owner")]
    pub max_queued_per_owner: usize,

    /// Grace period granted to in-flight work on cancellation (default: 5
    /// seconds)
    #[serde(default = "default_cancel_grace", with = "duration_serde")]
    pub cancel_grace: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_owner: default_max_jobs_per_owner(),
            max_queued_per_owner: default_max_queued_per_owner(),
            cancel_grace: default_cancel_grace(),
        }
    }
}

/// Progress reporter configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// Cadence of rendered status lines per job (default: 4 seconds)
    #[serde(default = "default_report_interval", with = "duration_serde")]
    pub update_interval: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            update_interval: default_report_interval(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts beyond the original (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`MediaRelay`](crate::MediaRelay)
///
/// Fields are organized into logical sub-configs:
/// - [`staging`](StagingConfig) — per-job staging slots and space checks
/// - [`fetch`](FetchConfig) — source retrieval limits and cadence
/// - [`transcode`](TranscodeConfig) — external tool paths and deadlines
/// - [`transport`](TransportConfig) — chunk sizing, parallelism, retries
/// - [`limits`](LimitsConfig) — per-owner admission limits
/// - [`reporter`](ReporterConfig) — status rendering cadence
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Staging area settings
    #[serde(default)]
    pub staging: StagingConfig,

    /// Source fetcher settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Transcoder adapter settings
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Chunked transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Per-owner limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Progress reporter settings
    #[serde(default)]
    pub reporter: ReporterConfig,
}

impl Config {
    /// Validate the configuration, returning a [`Error::Config`] naming the
    /// offending key on failure.
    pub fn validate(&self) -> Result<()> {
        if self.transport.chunk_size == 0 {
            return Err(Error::Config {
                message: "chunk size must be greater than zero".to_string(),
                key: Some("transport.chunk_size".to_string()),
            });
        }
        if self.transport.max_parallel_chunks == 0 {
            return Err(Error::Config {
                message: "chunk pool size must be greater than zero".to_string(),
                key: Some("transport.max_parallel_chunks".to_string()),
            });
        }
        if self.limits.max_jobs_per_owner == 0 {
            return Err(Error::Config {
                message: "per-owner job limit must be greater than zero".to_string(),
                key: Some("limits.max_jobs_per_owner".to_string()),
            });
        }
        if self.fetch.max_file_size == 0 {
            return Err(Error::Config {
                message: "maximum file size must be greater than zero".to_string(),
                key: Some("fetch.max_file_size".to_string()),
            });
        }
        if !(0.0..=100.0).contains(&self.fetch.progress_percent_step) {
            return Err(Error::Config {
                message: "progress percent step must be between 0 and 100".to_string(),
                key: Some("fetch.progress_percent_step".to_string()),
            });
        }
        if self.staging.size_multiplier < 1.0 {
            return Err(Error::Config {
                message: "staging size multiplier must be at least 1.0".to_string(),
                key: Some("staging.size_multiplier".to_string()),
            });
        }
        Ok(())
    }
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("./staging")
}

fn default_min_free_space() -> u64 {
    512 * 1024 * 1024
}

fn default_size_multiplier() -> f64 {
    2.5
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_progress_percent_step() -> f64 {
    1.0
}

fn default_transcode_base_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_transcode_timeout_per_gib() -> Duration {
    Duration::from_secs(120)
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_chunk_size() -> u64 {
    2_000_000_000
}

fn default_max_parallel_chunks() -> usize {
    4
}

fn default_token_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_jobs_per_owner() -> usize {
    2
}

fn default_max_queued_per_owner() -> usize {
    8
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(4)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn default_config_passes_validation() {
        tokio_test::assert_ok!(Config::default().validate());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.transport.chunk_size, 2_000_000_000);
        assert_eq!(config.transport.max_parallel_chunks, 4);
        assert_eq!(config.transport.retry.max_attempts, 5);
        assert_eq!(config.fetch.max_file_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.transcode.base_timeout, Duration::from_secs(300));
        assert_eq!(config.limits.max_jobs_per_owner, 2);
        assert_eq!(config.reporter.update_interval, Duration::from_secs(4));
        assert!(!config.transport.token_cache.enabled);
        assert_eq!(
            config.transport.token_cache.retention,
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn zero_chunk_size_fails_validation_with_key() {
        let mut config = Config::default();
        config.transport.chunk_size = 0;

        let err = config.validate().unwrap_err();
        match err {
            crate::error::Error::Config { key, .. } => {
                assert_eq!(key.as_deref(), Some("transport.chunk_size"));
            }
            other => panic!("expected Config error, got {other}"),
        }
    }

    #[test]
    fn zero_pool_size_fails_validation() {
        let mut config = Config::default();
        config.transport.max_parallel_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_owner_limit_fails_validation() {
        let mut config = Config::default();
        config.limits.max_jobs_per_owner = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn size_multiplier_below_one_fails_validation() {
        let mut config = Config::default();
        config.staging.size_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.transport.chunk_size, 2_000_000_000);
        assert_eq!(config.limits.max_queued_per_owner, 8);
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["transcode"]["base_timeout"], 300);
        assert_eq!(json["fetch"]["progress_interval"], 2);
        assert_eq!(json["transport"]["retry"]["initial_delay"], 1);
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let json = r#"{"transcode": {"base_timeout": 42}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.transcode.base_timeout, Duration::from_secs(42));
        // Unspecified siblings keep their defaults
        assert_eq!(config.transcode.kill_grace, Duration::from_secs(5));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = Config::default();
        config.transport.chunk_size = 1024;
        config.limits.max_jobs_per_owner = 7;
        config.transcode.ffmpeg_path = Some(PathBuf::from("/opt/ffmpeg"));

        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(back.transport.chunk_size, 1024);
        assert_eq!(back.limits.max_jobs_per_owner, 7);
        assert_eq!(back.transcode.ffmpeg_path, Some(PathBuf::from("/opt/ffmpeg")));
    }
}
