//! Core types for media-relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a transfer job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<JobId> for u64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Chat identity on whose behalf a transfer job runs.
///
/// The unit of per-owner concurrency accounting: admission limits are
/// enforced per `OwnerId`, never globally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl OwnerId {
    /// Create a new OwnerId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for OwnerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer job state
///
/// Linear happy path `Queued -> Fetching -> (Transcoding) -> Uploading -> Completed`,
/// with `Cancelled` and `Failed` reachable from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for an admission slot for its owner
    Queued,
    /// Retrieving source media into the staging area
    Fetching,
    /// Running the external media tool
    Transcoding,
    /// Delivering chunks to the chat platform
    Uploading,
    /// Finalize acknowledged by the platform
    Completed,
    /// Terminal error (exactly one failure status was emitted)
    Failed,
    /// Cancelled by external signal
    Cancelled,
}

impl JobState {
    /// Whether the job has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the job currently occupies one of its owner's admission slots
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Fetching | JobState::Transcoding | JobState::Uploading
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Fetching => "fetching",
            JobState::Transcoding => "transcoding",
            JobState::Uploading => "uploading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Pipeline phase a progress snapshot belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Source retrieval
    Fetch,
    /// External media tool processing
    Transcode,
    /// Chunked delivery to the platform
    Upload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Fetch => "fetch",
            Phase::Transcode => "transcode",
            Phase::Upload => "upload",
        };
        write!(f, "{s}")
    }
}

/// Where the source media comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// An HTTP/HTTPS URL fetched by the source fetcher
    Url {
        /// The source URL
        url: url::Url,
    },
    /// A file already held by the chat platform, re-fetched through the
    /// chunked transport's download path
    RemoteFile {
        /// Platform file identifier
        id: RemoteFileId,
        /// Size in bytes, when the platform advertised it
        size_hint: Option<u64>,
    },
}

/// Destination of a transfer job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Destination chat
    pub chat_id: i64,

    /// Filename to present to the platform (derived from the source when None)
    #[serde(default)]
    pub filename: Option<String>,

    /// Optional caption attached on finalize
    #[serde(default)]
    pub caption: Option<String>,
}

/// Opaque identifier of a finalized remote file, issued by the platform
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteFileId(pub String);

impl std::fmt::Display for RemoteFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-chunk upload token returned by the platform on a successful
/// `send_chunk` call and consumed, in ascending sequence order, by finalize.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkToken(pub String);

impl std::fmt::Display for ChunkToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ephemeral byte-level progress report
///
/// Produced continuously by the pipeline components, consumed by the
/// progress reporter and discarded after emission.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Job this snapshot belongs to
    pub job_id: JobId,
    /// Phase that produced the snapshot
    pub phase: Phase,
    /// Bytes processed so far in this phase
    pub bytes_done: u64,
    /// Total bytes for this phase (None while unknown)
    pub bytes_total: Option<u64>,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Create a snapshot stamped with the current time
    pub fn now(job_id: JobId, phase: Phase, bytes_done: u64, bytes_total: Option<u64>) -> Self {
        Self {
            job_id,
            phase,
            bytes_done,
            bytes_total,
            timestamp: Utc::now(),
        }
    }

    /// Completion fraction in `[0.0, 1.0]` when the total is known
    pub fn fraction(&self) -> Option<f64> {
        self.bytes_total.filter(|t| *t > 0).map(|t| {
            let f = self.bytes_done as f64 / t as f64;
            f.min(1.0)
        })
    }
}

/// Event emitted during the transfer job lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job accepted and waiting for an admission slot
    Queued {
        /// Job ID
        id: JobId,
        /// Owning chat identity
        owner: OwnerId,
    },

    /// Job acquired its owner's admission slot and started running
    Admitted {
        /// Job ID
        id: JobId,
    },

    /// A pipeline phase started
    PhaseStarted {
        /// Job ID
        id: JobId,
        /// The phase that began
        phase: Phase,
    },

    /// Byte-level progress within a phase
    Progress(ProgressSnapshot),

    /// The transcode phase timed out and is being retried with relaxed quality
    TranscodeRetried {
        /// Job ID
        id: JobId,
    },

    /// A chunk was acknowledged by the platform
    ChunkUploaded {
        /// Job ID
        id: JobId,
        /// Chunk sequence index
        index: u32,
        /// Total chunks in the plan
        total: u32,
    },

    /// Transfer completed; the platform committed the file
    Completed {
        /// Job ID
        id: JobId,
        /// Identifier of the finalized remote file
        remote_id: RemoteFileId,
    },

    /// Transfer failed (emitted exactly once per failed job)
    Failed {
        /// Job ID
        id: JobId,
        /// Phase in which the terminal error occurred
        phase: Phase,
        /// Human-readable error
        error: String,
    },

    /// Transfer cancelled by external signal
    Cancelled {
        /// Job ID
        id: JobId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Public status view of a transfer job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfo {
    /// Unique job identifier
    pub id: JobId,

    /// Owning chat identity
    pub owner: OwnerId,

    /// Current state
    pub state: JobState,

    /// Phase currently executing (None while queued or terminal)
    pub phase: Option<Phase>,

    /// Bytes processed in the current phase
    pub bytes_done: u64,

    /// Total bytes for the current phase (None while unknown)
    pub bytes_total: Option<u64>,

    /// Staged file path while one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_path: Option<PathBuf>,

    /// Remote file identifier once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteFileId>,

    /// Error message for failed jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the job was submitted
    pub created_at: DateTime<Utc>,

    /// Last state or progress change
    pub updated_at: DateTime<Utc>,
}

/// Aggregate pipeline statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Total jobs known to the in-memory table
    pub total: usize,

    /// Jobs waiting for admission
    pub queued: usize,

    /// Jobs in the fetch phase
    pub fetching: usize,

    /// Jobs in the transcode phase
    pub transcoding: usize,

    /// Jobs in the upload phase
    pub uploading: usize,

    /// Completed jobs
    pub completed: usize,

    /// Failed jobs
    pub failed: usize,

    /// Cancelled jobs
    pub cancelled: usize,

    /// Whether the pipeline is accepting new submissions
    pub accepting_new: bool,
}
