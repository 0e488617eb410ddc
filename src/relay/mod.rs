//! Job coordinator — owns the lifecycle of every transfer job
//!
//! The `MediaRelay` struct and its methods are organized by domain:
//! - [`admission`] - per-owner concurrency gating
//! - [`job_task`] - per-job pipeline execution
//! - [`control`] - cancel/status/list/stats
//! - [`lifecycle`] - graceful shutdown

mod admission;
mod control;
mod job_task;
mod lifecycle;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::Config;
use crate::error::{AdmissionError, Error, Result};
use crate::fetch::Fetcher;
use crate::staging::StagingArea;
use crate::transcode::{MediaProfile, Transcoder};
use crate::transport::{ChunkClient, ChunkedTransport};
use crate::types::{
    Event, JobId, JobInfo, JobState, OwnerId, SourceDescriptor, TargetDescriptor,
};

/// Job table and cancellation state
#[derive(Clone)]
pub(crate) struct RelayState {
    /// In-memory job table; the only job store (nothing persists past the process)
    pub(crate) jobs: Arc<tokio::sync::Mutex<HashMap<JobId, JobInfo>>>,
    /// Map of live jobs to their cancellation tokens
    pub(crate) active: Arc<
        tokio::sync::Mutex<HashMap<JobId, tokio_util::sync::CancellationToken>>,
    >,
    /// Whether new submissions are accepted (cleared during shutdown)
    pub(crate) accepting_new: Arc<std::sync::atomic::AtomicBool>,
    /// Monotonic job id source
    pub(crate) next_job_id: Arc<std::sync::atomic::AtomicU64>,
}

/// Media transfer pipeline coordinator (cloneable - all fields are Arc-wrapped)
///
/// Sequences Fetch → (Transcode) → Upload for each submitted job, enforces
/// per-owner concurrency limits, and emits lifecycle and progress events on
/// a broadcast channel.
#[derive(Clone)]
pub struct MediaRelay {
    /// Configuration (shared across job tasks)
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Job table and cancellation state
    pub(crate) state: RelayState,
    /// Per-owner admission gate
    pub(crate) admission: Arc<admission::Admission>,
    /// Staging filesystem area
    pub(crate) staging: Arc<StagingArea>,
    /// Source fetcher
    pub(crate) fetcher: Arc<Fetcher>,
    /// Transcoder adapter
    pub(crate) transcoder: Arc<Transcoder>,
    /// Chunked transport over the platform client
    pub(crate) transport: Arc<ChunkedTransport>,
}

impl MediaRelay {
    /// Create a new MediaRelay over the supplied platform client
    ///
    /// Validates the configuration, creates the staging root, and wires the
    /// pipeline components. The platform client is shared, never owned
    /// exclusively — its own connection multiplexing handles concurrency.
    pub async fn new(config: Config, client: Arc<dyn ChunkClient>) -> Result<Self> {
        config.validate()?;

        let staging = Arc::new(StagingArea::new(config.staging.clone()).await?);
        let fetcher = Arc::new(Fetcher::new(config.fetch.clone())?);
        let transcoder = Arc::new(Transcoder::new(config.transcode.clone()));

        // Broadcast buffer sized for bursts; slow subscribers observe Lagged
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1024);

        let transport = Arc::new(ChunkedTransport::new(
            client,
            config.transport.clone(),
            event_tx.clone(),
        ));

        let admission = Arc::new(admission::Admission::new(config.limits.max_jobs_per_owner));

        let state = RelayState {
            jobs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            active: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            accepting_new: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            next_job_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        };

        Ok(Self {
            config: Arc::new(config),
            event_tx,
            state,
            admission,
            staging,
            fetcher,
            transcoder,
            transport,
        })
    }

    /// Submit a transfer job
    ///
    /// The job enters the table as Queued and its task is spawned
    /// immediately; the task waits for one of the owner's admission slots
    /// before running. Rejected with an [`AdmissionError`] when shutting
    /// down or when the owner's queued backlog exceeds the configured cap.
    pub async fn submit(
        &self,
        owner: OwnerId,
        source: SourceDescriptor,
        target: TargetDescriptor,
        profile: Option<MediaProfile>,
    ) -> Result<JobId> {
        if !self
            .state
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::Admission(AdmissionError::ShuttingDown));
        }

        let id = JobId::new(
            self.state
                .next_job_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        );
        let now = Utc::now();
        let info = JobInfo {
            id,
            owner,
            state: JobState::Queued,
            phase: None,
            bytes_done: 0,
            bytes_total: None,
            staged_path: None,
            remote_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        {
            let mut jobs = self.state.jobs.lock().await;

            // Backlog cap: queued (not yet admitted) jobs per owner
            let queued = jobs
                .values()
                .filter(|j| j.owner == owner && j.state == JobState::Queued)
                .count();
            if queued >= self.config.limits.max_queued_per_owner {
                return Err(Error::Admission(AdmissionError::QueueFull {
                    owner,
                    depth: queued,
                    limit: self.config.limits.max_queued_per_owner,
                }));
            }

            jobs.insert(id, info);
        }

        let cancel_token = tokio_util::sync::CancellationToken::new();
        {
            let mut active = self.state.active.lock().await;
            active.insert(id, cancel_token.clone());
        }

        self.emit_event(Event::Queued { id, owner });
        tracing::info!(job_id = id.0, owner = owner.0, "Job queued");

        let ctx = job_task::JobTaskContext {
            id,
            owner,
            relay: self.clone(),
            cancel: cancel_token,
        };
        tokio::spawn(async move {
            job_task::run_job_task(ctx, source, target, profile).await;
        });

        Ok(id)
    }

    /// Subscribe to pipeline events
    ///
    /// Multiple subscribers are supported. Each receives all events
    /// independently; a subscriber lagging more than the channel buffer
    /// observes `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Subscribe to pipeline events as a `Stream`
    ///
    /// Wraps [`subscribe`](Self::subscribe) for use with stream combinators
    /// or SSE-style forwarding to a chat frontend.
    pub fn event_stream(&self) -> tokio_stream::wrappers::BroadcastStream<Event> {
        tokio_stream::wrappers::BroadcastStream::new(self.subscribe())
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers the event is dropped; the
    /// pipeline never depends on anyone listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Apply a mutation to a job table entry, stamping `updated_at`
    pub(crate) async fn update_job<F>(&self, id: JobId, mutate: F)
    where
        F: FnOnce(&mut JobInfo),
    {
        let mut jobs = self.state.jobs.lock().await;
        if let Some(info) = jobs.get_mut(&id) {
            mutate(info);
            info.updated_at = Utc::now();
        }
    }
}
