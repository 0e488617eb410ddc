//! Progress reporter — throttled, human-readable status lines
//!
//! Pure aggregation over the event stream: the reporter holds the latest
//! snapshot per job and renders a status line at a fixed cadence or on
//! phase change, never more often per job. It keeps no state across
//! restarts and has no side effects beyond emission.

use std::collections::HashMap;

use crate::config::ReporterConfig;
use crate::types::{Event, JobId, Phase};
use crate::utils::format_bytes;

/// One rendered status update for a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusLine {
    /// The job the line describes
    pub job_id: JobId,
    /// Display-ready text
    pub text: String,
}

/// Latest observed state for one job
struct ReportEntry {
    phase: Phase,
    bytes_done: u64,
    bytes_total: Option<u64>,
    dirty: bool,
}

/// Spawn the reporter over an event subscription
///
/// Returns the task handle and the receiving end of the rendered status
/// stream. The task ends when the event channel closes or a Shutdown event
/// arrives; dropping the receiver ends it too.
pub fn spawn_status_reporter(
    mut events: tokio::sync::broadcast::Receiver<Event>,
    config: ReporterConfig,
) -> (
    tokio::task::JoinHandle<()>,
    tokio::sync::mpsc::Receiver<StatusLine>,
) {
    let (line_tx, line_rx) = tokio::sync::mpsc::channel::<StatusLine>(256);

    let handle = tokio::spawn(async move {
        let mut entries: HashMap<JobId, ReportEntry> = HashMap::new();
        let mut interval = tokio::time::interval(config.update_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if handle_event(event, &mut entries, &line_tx).await.is_err() {
                                return; // receiver dropped or shutdown
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Status reporter lagged behind the event stream");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return;
                        }
                    }
                }
                _ = interval.tick() => {
                    // Cadence tick: render jobs that changed since the last emission
                    for (job_id, entry) in entries.iter_mut() {
                        if entry.dirty {
                            entry.dirty = false;
                            let line = StatusLine {
                                job_id: *job_id,
                                text: render_progress(entry),
                            };
                            if line_tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    (handle, line_rx)
}

impl crate::MediaRelay {
    /// Spawn a status reporter over this pipeline's event stream
    ///
    /// Convenience wrapper around [`spawn_status_reporter`] using the
    /// pipeline's configured cadence.
    pub fn spawn_status_reporter(
        &self,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::Receiver<StatusLine>,
    ) {
        spawn_status_reporter(self.subscribe(), self.get_config().reporter.clone())
    }
}

/// Returns Err to stop the reporter task
async fn handle_event(
    event: Event,
    entries: &mut HashMap<JobId, ReportEntry>,
    line_tx: &tokio::sync::mpsc::Sender<StatusLine>,
) -> Result<(), ()> {
    match event {
        Event::Progress(snapshot) => {
            let entry = entries.entry(snapshot.job_id).or_insert(ReportEntry {
                phase: snapshot.phase,
                bytes_done: 0,
                bytes_total: None,
                dirty: false,
            });
            entry.phase = snapshot.phase;
            entry.bytes_done = snapshot.bytes_done;
            entry.bytes_total = snapshot.bytes_total;
            entry.dirty = true;
            Ok(())
        }
        // Phase changes render immediately
        Event::PhaseStarted { id, phase } => {
            entries.insert(
                id,
                ReportEntry {
                    phase,
                    bytes_done: 0,
                    bytes_total: None,
                    dirty: false,
                },
            );
            let text = match phase {
                Phase::Fetch => "fetching source".to_string(),
                Phase::Transcode => "transcoding".to_string(),
                Phase::Upload => "uploading".to_string(),
            };
            line_tx
                .send(StatusLine { job_id: id, text })
                .await
                .map_err(|_| ())
        }
        // Terminal events render immediately and drop the entry
        Event::Completed { id, remote_id } => {
            entries.remove(&id);
            line_tx
                .send(StatusLine {
                    job_id: id,
                    text: format!("completed ({remote_id})"),
                })
                .await
                .map_err(|_| ())
        }
        Event::Failed { id, phase, error } => {
            entries.remove(&id);
            line_tx
                .send(StatusLine {
                    job_id: id,
                    text: format!("failed during {phase}: {error}"),
                })
                .await
                .map_err(|_| ())
        }
        Event::Cancelled { id } => {
            entries.remove(&id);
            line_tx
                .send(StatusLine {
                    job_id: id,
                    text: "cancelled".to_string(),
                })
                .await
                .map_err(|_| ())
        }
        Event::Shutdown => Err(()),
        // Queued/Admitted/ChunkUploaded/TranscodeRetried don't render lines
        _ => Ok(()),
    }
}

/// Render a progress entry as one display line
fn render_progress(entry: &ReportEntry) -> String {
    let verb = match entry.phase {
        Phase::Fetch => "fetching",
        Phase::Transcode => "transcoding",
        Phase::Upload => "uploading",
    };
    match entry.bytes_total {
        Some(total) if total > 0 => {
            let percent = (entry.bytes_done as f64 / total as f64 * 100.0).min(100.0);
            format!(
                "{verb} {percent:.0}% ({} / {})",
                format_bytes(entry.bytes_done),
                format_bytes(total)
            )
        }
        _ => format!("{verb} {}", format_bytes(entry.bytes_done)),
    }
}
