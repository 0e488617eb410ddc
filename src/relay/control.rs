//! Job control — cancellation, status queries, and statistics

use crate::error::{Error, Result};
use crate::types::{JobId, JobInfo, JobState, PipelineStats};

use super::MediaRelay;

impl MediaRelay {
    /// Cancel a job in any non-terminal state
    ///
    /// Signals the job's cancellation token; the job task gives in-flight
    /// work the configured grace period, purges its staging slot, and
    /// transitions to Cancelled. Returns `true` if a live job was
    /// signalled, `false` for unknown or already-terminal jobs.
    pub async fn cancel(&self, id: JobId) -> bool {
        let active = self.state.active.lock().await;
        match active.get(&id) {
            Some(token) => {
                tracing::info!(job_id = id.0, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Current status of a job
    pub async fn status(&self, id: JobId) -> Result<JobInfo> {
        let jobs = self.state.jobs.lock().await;
        jobs.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    /// All jobs known to the in-memory table, newest first
    pub async fn list(&self) -> Vec<JobInfo> {
        let jobs = self.state.jobs.lock().await;
        let mut list: Vec<JobInfo> = jobs.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Aggregate pipeline statistics
    pub async fn stats(&self) -> PipelineStats {
        let jobs = self.state.jobs.lock().await;
        let mut stats = PipelineStats {
            total: jobs.len(),
            accepting_new: self
                .state
                .accepting_new
                .load(std::sync::atomic::Ordering::SeqCst),
            ..Default::default()
        };

        for info in jobs.values() {
            match info.state {
                JobState::Queued => stats.queued += 1,
                JobState::Fetching => stats.fetching += 1,
                JobState::Transcoding => stats.transcoding += 1,
                JobState::Uploading => stats.uploading += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop terminal jobs from the table, returning how many were removed
    ///
    /// The table is the only job store and otherwise grows for the life of
    /// the process; embedders call this on their own schedule.
    pub async fn prune_finished(&self) -> usize {
        let mut jobs = self.state.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, info| !info.state.is_terminal());
        before - jobs.len()
    }
}
