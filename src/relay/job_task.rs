//! Job task execution — the full pipeline lifecycle for a single transfer
//!
//! Phases are strictly sequential within a job:
//! admission → Fetching → (Transcoding) → Uploading → Completed.
//! Every exit path — success, failure, cancellation — purges the job's
//! staging slot, discards cached chunk tokens, and emits exactly one
//! terminal event.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::staging::{StagedFile, StagingSlot};
use crate::transcode::{self, MediaProfile, TranscodeSpec};
use crate::types::{
    Event, JobId, JobState, OwnerId, Phase, ProgressSnapshot, RemoteFileId, SourceDescriptor,
    TargetDescriptor,
};

use super::MediaRelay;

/// Shared context for a single job task
pub(crate) struct JobTaskContext {
    pub(crate) id: JobId,
    pub(crate) owner: OwnerId,
    pub(crate) relay: MediaRelay,
    pub(crate) cancel: CancellationToken,
}

impl JobTaskContext {
    /// Remove this job from the active (cancellable) map
    async fn remove_from_active(&self) {
        let mut active = self.relay.state.active.lock().await;
        active.remove(&self.id);
    }

    /// Enter a pipeline phase: update the table and announce it
    async fn enter_phase(&self, state: JobState, phase: Phase) {
        self.relay
            .update_job(self.id, |info| {
                info.state = state;
                info.phase = Some(phase);
                info.bytes_done = 0;
                info.bytes_total = None;
            })
            .await;
        self.relay.emit_event(Event::PhaseStarted { id: self.id, phase });
    }

    /// Mark the job Completed (the platform acknowledged finalize)
    async fn mark_completed(&self, remote_id: RemoteFileId) {
        self.relay
            .update_job(self.id, |info| {
                info.state = JobState::Completed;
                info.phase = None;
                info.staged_path = None;
                info.remote_id = Some(remote_id.clone());
            })
            .await;
        self.remove_from_active().await;
        self.relay.emit_event(Event::Completed {
            id: self.id,
            remote_id,
        });
        tracing::info!(job_id = self.id.0, "Job completed");
    }

    /// Mark the job Failed and emit its single failure event
    async fn mark_failed(&self, phase: Phase, error: &str) {
        self.relay
            .update_job(self.id, |info| {
                info.state = JobState::Failed;
                info.phase = None;
                info.staged_path = None;
                info.error = Some(error.to_string());
            })
            .await;
        self.remove_from_active().await;
        self.relay.emit_event(Event::Failed {
            id: self.id,
            phase,
            error: error.to_string(),
        });
        tracing::warn!(job_id = self.id.0, phase = %phase, error = %error, "Job failed");
    }

    /// Mark the job Cancelled
    async fn mark_cancelled(&self) {
        self.relay
            .update_job(self.id, |info| {
                info.state = JobState::Cancelled;
                info.phase = None;
                info.staged_path = None;
            })
            .await;
        self.remove_from_active().await;
        self.relay.emit_event(Event::Cancelled { id: self.id });
        tracing::info!(job_id = self.id.0, "Job cancelled");
    }
}

/// Run one transfer job end to end
pub(crate) async fn run_job_task(
    ctx: JobTaskContext,
    source: SourceDescriptor,
    target: TargetDescriptor,
    profile: Option<MediaProfile>,
) {
    // Wait in Queued until the owner has a free slot; the permit holds the
    // slot for the rest of the job
    let _permit = tokio::select! {
        permit = ctx.relay.admission.acquire(ctx.owner) => match permit {
            Ok(permit) => permit,
            Err(e) => {
                ctx.mark_failed(Phase::Fetch, &e.to_string()).await;
                return;
            }
        },
        _ = ctx.cancel.cancelled() => {
            ctx.mark_cancelled().await;
            return;
        }
    };
    ctx.relay.emit_event(Event::Admitted { id: ctx.id });

    let slot = match ctx.relay.staging.allocate(ctx.id).await {
        Ok(slot) => slot,
        Err(e) => {
            ctx.mark_failed(Phase::Fetch, &e.to_string()).await;
            return;
        }
    };

    // Convert component progress into table updates and broadcast events,
    // decoupling emission cadence from component callback frequency
    let (progress_tx, mut progress_rx) =
        tokio::sync::mpsc::channel::<ProgressSnapshot>(64);
    let forwarder = {
        let relay = ctx.relay.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = progress_rx.recv().await {
                relay
                    .update_job(snapshot.job_id, |info| {
                        info.bytes_done = snapshot.bytes_done;
                        info.bytes_total = snapshot.bytes_total;
                    })
                    .await;
                relay.emit_event(Event::Progress(snapshot));
            }
        })
    };

    // Run the phases; on cancellation, in-flight work gets a bounded grace
    // period to wind down before being abandoned outright
    let grace = ctx.relay.config.limits.cancel_grace;
    let outcome = {
        let pipeline = run_pipeline(
            &ctx,
            source,
            &target,
            profile,
            &slot,
            progress_tx.clone(),
        );
        tokio::pin!(pipeline);

        let uninterrupted = tokio::select! {
            outcome = &mut pipeline => Some(outcome),
            _ = ctx.cancel.cancelled() => None,
        };
        match uninterrupted {
            Some(outcome) => outcome,
            // Cancelled: let in-flight work wind down within the grace
            // period, then abandon whatever remains
            None => match tokio::time::timeout(grace, &mut pipeline).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(
                        job_id = ctx.id.0,
                        grace_secs = grace.as_secs(),
                        "In-flight work exceeded the cancellation grace period, abandoning"
                    );
                    Err(Error::Cancelled)
                }
            },
        }
    };

    drop(progress_tx);
    let _ = forwarder.await;

    // Terminal cleanup runs before any terminal event is emitted
    slot.purge().await;
    ctx.relay.transport.evict_tokens(ctx.id);

    match outcome {
        Ok(remote_id) => ctx.mark_completed(remote_id).await,
        Err(Error::Cancelled) => ctx.mark_cancelled().await,
        Err(e) if ctx.cancel.is_cancelled() => {
            // Subcomponents may surface cancellation as their own error
            tracing::debug!(job_id = ctx.id.0, error = %e, "Error during cancellation wind-down");
            ctx.mark_cancelled().await;
        }
        Err(e) => {
            let phase = error_phase(&e).unwrap_or(Phase::Fetch);
            ctx.mark_failed(phase, &e.to_string()).await;
        }
    }
}

/// The sequential pipeline body: fetch, optional transcode, upload
async fn run_pipeline(
    ctx: &JobTaskContext,
    source: SourceDescriptor,
    target: &TargetDescriptor,
    profile: Option<MediaProfile>,
    slot: &StagingSlot,
    progress_tx: tokio::sync::mpsc::Sender<ProgressSnapshot>,
) -> Result<RemoteFileId> {
    // --- Fetch ---
    ctx.enter_phase(JobState::Fetching, Phase::Fetch).await;
    let fetched = run_fetch_phase(ctx, &source, slot, &progress_tx).await?;
    ctx.relay
        .update_job(ctx.id, |info| info.staged_path = Some(fetched.path.clone()))
        .await;

    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // --- Transcode (optional, skipped on pass-through) ---
    let staged = match profile {
        Some(profile) if !transcode::is_passthrough(&profile, &fetched.path) => {
            ctx.enter_phase(JobState::Transcoding, Phase::Transcode).await;
            let output = run_transcode_phase(ctx, &fetched, profile, slot, &progress_tx).await?;
            ctx.relay
                .update_job(ctx.id, |info| info.staged_path = Some(output.path.clone()))
                .await;
            output
        }
        _ => fetched,
    };

    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // --- Upload ---
    ctx.enter_phase(JobState::Uploading, Phase::Upload).await;
    ctx.relay
        .transport
        .upload(&staged, target, ctx.id, &progress_tx, &ctx.cancel)
        .await
}

/// Fetch the source into the slot, retrying a retryable failure once
async fn run_fetch_phase(
    ctx: &JobTaskContext,
    source: &SourceDescriptor,
    slot: &StagingSlot,
    progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
) -> Result<StagedFile> {
    match source {
        SourceDescriptor::Url { url } => {
            ctx.relay.staging.ensure_space(0)?;

            let mut retried = false;
            loop {
                match ctx
                    .relay
                    .fetcher
                    .fetch(url, slot, ctx.id, progress_tx)
                    .await
                {
                    Ok(staged) => return Ok(staged),
                    Err(e) if e.is_retryable() && !retried => {
                        tracing::warn!(job_id = ctx.id.0, error = %e, "Fetch failed, retrying once");
                        retried = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        SourceDescriptor::RemoteFile { id, size_hint } => {
            ctx.relay.staging.ensure_space(size_hint.unwrap_or(0))?;

            // Chunk-level retries happen inside the transport
            ctx.relay
                .transport
                .download(id, slot, "source.bin", ctx.id, progress_tx, &ctx.cancel)
                .await
        }
    }
}

/// Run the media tool; a timeout is retried exactly once with relaxed quality
async fn run_transcode_phase(
    ctx: &JobTaskContext,
    input: &StagedFile,
    profile: MediaProfile,
    slot: &StagingSlot,
    progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
) -> Result<StagedFile> {
    let output = slot.file(&format!("output.{}", profile.output_extension()));
    let mut spec = TranscodeSpec {
        input: input.path.clone(),
        output,
        profile,
        relaxed: false,
    };

    match ctx
        .relay
        .transcoder
        .transcode(&spec, ctx.id, progress_tx, &ctx.cancel)
        .await
    {
        Ok(staged) => Ok(staged),
        Err(e) if e.is_retryable() && !ctx.cancel.is_cancelled() => {
            tracing::warn!(
                job_id = ctx.id.0,
                error = %e,
                "Transcode timed out, retrying once with relaxed quality"
            );
            ctx.relay.emit_event(Event::TranscodeRetried { id: ctx.id });
            spec.relaxed = true;
            ctx.relay
                .transcoder
                .transcode(&spec, ctx.id, progress_tx, &ctx.cancel)
                .await
                .map_err(Into::into)
        }
        Err(e) => Err(e.into()),
    }
}

/// Attribute an error to the pipeline phase that produced it
fn error_phase(error: &Error) -> Option<Phase> {
    match error {
        Error::Fetch(_) => Some(Phase::Fetch),
        Error::Transcode(_) => Some(Phase::Transcode),
        Error::Transport(_) => Some(Phase::Upload),
        Error::InsufficientSpace { .. } | Error::SpaceCheckFailed(_) => Some(Phase::Fetch),
        _ => None,
    }
}
