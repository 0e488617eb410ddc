//! Startup and shutdown coordination

use crate::error::Result;
use crate::types::Event;

use super::MediaRelay;

/// How long shutdown waits for live jobs to wind down
const SHUTDOWN_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

impl MediaRelay {
    /// Gracefully shut down the pipeline
    ///
    /// 1. Stops accepting new submissions
    /// 2. Signals cancellation to every live job
    /// 3. Waits (bounded) for job tasks to finish their cleanup
    /// 4. Emits the final Shutdown event
    ///
    /// Job tasks purge their own staging slots as they wind down, so a
    /// completed shutdown leaves no staged files behind.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.state
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);

        self.cancel_all().await;

        match tokio::time::timeout(SHUTDOWN_WAIT, self.wait_for_live_jobs()).await {
            Ok(()) => {
                tracing::info!("All jobs wound down cleanly");
            }
            Err(_) => {
                tracing::warn!(
                    wait_secs = SHUTDOWN_WAIT.as_secs(),
                    "Timeout waiting for jobs to wind down, proceeding with shutdown"
                );
            }
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Signal cancellation to every live job
    pub(crate) async fn cancel_all(&self) {
        let active = self.state.active.lock().await;
        tracing::debug!(active_count = active.len(), "Cancelling all live jobs");
        for (id, token) in active.iter() {
            tracing::debug!(job_id = id.0, "Signalling cancellation");
            token.cancel();
        }
    }

    /// Wait until the active map drains
    async fn wait_for_live_jobs(&self) {
        loop {
            let live = {
                let active = self.state.active.lock().await;
                active.len()
            };
            if live == 0 {
                return;
            }
            tracing::debug!(live, "Waiting for live jobs to finish");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
