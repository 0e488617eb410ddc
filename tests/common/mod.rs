//! Shared fixtures for end-to-end pipeline tests.

use std::sync::Arc;
use std::time::Duration;

use media_relay::{
    Config, Event, InMemoryChunkClient, JobId, JobState, MediaRelay, RetryConfig,
    TargetDescriptor,
};

/// Fast-everything config rooted in a temp directory.
pub fn fast_config(staging_root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.staging.root_dir = staging_root.to_path_buf();
    config.staging.check_free_space = false;
    config.fetch.max_file_size = 64 * 1024 * 1024;
    config.fetch.progress_interval = Duration::from_millis(0);
    config.fetch.progress_percent_step = 0.0;
    config.transcode.search_path = false;
    config.transcode.kill_grace = Duration::from_millis(100);
    config.transport.chunk_size = 2000;
    config.transport.max_parallel_chunks = 4;
    config.transport.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.limits.cancel_grace = Duration::from_millis(500);
    config.reporter.update_interval = Duration::from_millis(50);
    config
}

/// Build a relay over a fresh in-memory platform client.
pub async fn build_relay(config: Config) -> (MediaRelay, Arc<InMemoryChunkClient>) {
    let client = Arc::new(InMemoryChunkClient::new());
    let relay = MediaRelay::new(config, client.clone())
        .await
        .expect("relay construction");
    (relay, client)
}

/// Default destination for test transfers.
pub fn target() -> TargetDescriptor {
    TargetDescriptor {
        chat_id: 42,
        filename: None,
        caption: None,
    }
}

/// Await a specific job's terminal event.
pub async fn wait_for_terminal(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: JobId,
    timeout: Duration,
) -> JobState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for job {id}"));
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(Event::Completed { id: done, .. })) if done == id => {
                return JobState::Completed;
            }
            Ok(Ok(Event::Failed { id: done, .. })) if done == id => return JobState::Failed,
            Ok(Ok(Event::Cancelled { id: done })) if done == id => return JobState::Cancelled,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("event channel closed while waiting for job {id}: {e}"),
            Err(_) => panic!("timed out waiting for job {id}"),
        }
    }
}

/// Number of `job_*` staging directories left on disk.
pub fn staging_dir_count(staging_root: &std::path::Path) -> usize {
    std::fs::read_dir(staging_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("job_"))
                .count()
        })
        .unwrap_or(0)
}
