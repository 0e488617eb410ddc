//! Error types for media-relay
//!
//! This module provides the error taxonomy for the pipeline:
//! - Per-component typed errors (Fetch, Transcode, Transport, Admission)
//! - A top-level [`Error`] that components report upward
//!
//! The job coordinator is the sole point translating these typed errors
//! into a user-visible status event, and it guarantees staging cleanup on
//! every failure path before that event is emitted.

use crate::types::{JobId, OwnerId};
use thiserror::Error;

/// Result type alias for media-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "transport.chunk_size")
        key: Option<String>,
    },

    /// Source fetch failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Media tool invocation failed
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    /// Chunked transfer to or from the platform failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Job admission rejected
    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Job cancelled by external signal
    #[error("job cancelled")]
    Cancelled,

    /// Job not found in the in-memory table
    #[error("job {0} not found")]
    NotFound(JobId),

    /// Cannot perform operation in current state
    #[error("cannot {operation} job {id} in state {current_state}")]
    InvalidState {
        /// The job ID that is in an invalid state for the operation
        id: JobId,
        /// The operation that was attempted (e.g., "cancel")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Insufficient staging space
    #[error("insufficient staging space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available in the staging area
        available: u64,
    },

    /// Failed to check staging free space
    #[error("failed to check staging space: {0}")]
    SpaceCheckFailed(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source fetcher errors
///
/// `Timeout` and `Network` are retryable (the coordinator retries the fetch
/// once); `NotFound` and `SizeLimitExceeded` are terminal immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The source does not exist (HTTP 404/410)
    #[error("source not found: {url}")]
    NotFound {
        /// The URL that was not found
        url: String,
    },

    /// The request or body transfer timed out
    #[error("fetch timed out: {url}")]
    Timeout {
        /// The URL that timed out
        url: String,
    },

    /// The source exceeds the configured maximum file size
    #[error("source exceeds size limit: {actual} > {limit} bytes")]
    SizeLimitExceeded {
        /// Configured maximum size in bytes
        limit: u64,
        /// Observed size in bytes (declared or streamed so far)
        actual: u64,
    },

    /// Connection or transfer-level network failure
    #[error("network error fetching {url}: {message}")]
    Network {
        /// The URL being fetched
        url: String,
        /// Underlying error description
        message: String,
    },
}

/// Transcoder adapter errors
///
/// All terminal except `Timeout`, which the coordinator retries once with a
/// relaxed quality profile before giving up.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The media tool binary could not be located
    #[error("media tool not found: {tool}")]
    ToolMissing {
        /// Binary name or configured path that failed to resolve
        tool: String,
    },

    /// The tool rejected the input as unreadable or malformed
    #[error("media tool rejected input: {message}")]
    BadInput {
        /// Diagnostic extracted from the tool's error stream
        message: String,
    },

    /// The tool exceeded its hard deadline and was terminated
    #[error("transcode timed out after {seconds}s")]
    Timeout {
        /// The deadline that was exceeded, in seconds
        seconds: u64,
    },

    /// The tool exited with a non-zero status
    #[error("media tool exited with status {exit_code:?}: {stderr_tail}")]
    ToolCrashed {
        /// Exit code when available (None if killed by signal)
        exit_code: Option<i32>,
        /// Tail of the tool's error stream for diagnostics
        stderr_tail: String,
    },
}

/// Chunked transport errors
///
/// `Network` and `RateLimited` are transient and retried per chunk inside
/// the transport; the remaining variants are terminal immediately.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A chunk exhausted its retry budget
    #[error("chunk {index} failed after {attempts} attempts: {message}")]
    ChunkFailed {
        /// Sequence index of the failed chunk
        index: u32,
        /// Attempts made (original + retries)
        attempts: u32,
        /// Last underlying error description
        message: String,
    },

    /// The platform throttled the call
    #[error("rate limited by platform{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited {
        /// Platform-suggested wait, when provided
        retry_after_secs: Option<u64>,
    },

    /// The platform session credentials are no longer valid
    #[error("platform authentication expired")]
    AuthExpired,

    /// The platform rejected the upload (size, permissions, bad token order)
    #[error("platform rejected request: {message}")]
    PlatformRejected {
        /// Platform-supplied rejection reason
        message: String,
    },

    /// Transient connection-level failure
    #[error("transport network error: {message}")]
    Network {
        /// Underlying error description
        message: String,
    },
}

/// Admission errors
///
/// Jobs over the owner's *concurrency* limit queue rather than erroring;
/// these variants cover the backlog cap and shutdown drain.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The owner's queued backlog exceeds the configured cap
    #[error("owner {owner} has {depth} queued jobs (limit {limit})")]
    QueueFull {
        /// The owner whose backlog is full
        owner: OwnerId,
        /// Current queued depth
        depth: usize,
        /// Configured backlog cap
        limit: usize,
    },

    /// The pipeline is draining and rejects new submissions
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl FetchError {
    /// Whether the coordinator should retry the fetch once
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Timeout { .. } | FetchError::Network { .. })
    }
}

impl TranscodeError {
    /// Whether the coordinator should retry once with relaxed quality
    pub fn is_retryable(&self) -> bool {
        matches!(self, TranscodeError::Timeout { .. })
    }
}

impl TransportError {
    /// Whether the transport should retry this chunk attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited { .. } | TransportError::Network { .. }
        )
    }
}
