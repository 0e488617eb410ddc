//! Shared test helpers for creating MediaRelay instances in tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use crate::config::{Config, RetryConfig, TokenCacheConfig};
use crate::relay::MediaRelay;
use crate::transport::InMemoryChunkClient;
use crate::types::{Event, JobId, JobState, TargetDescriptor};

/// Fast-everything config rooted in a temp directory.
pub(crate) fn test_config(staging_root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.staging.root_dir = staging_root.to_path_buf();
    config.staging.check_free_space = false;
    config.fetch.max_file_size = 64 * 1024 * 1024;
    config.fetch.progress_interval = Duration::from_millis(0);
    config.fetch.progress_percent_step = 0.0;
    config.transcode.search_path = false; // No external tool unless a test wires one
    config.transcode.kill_grace = Duration::from_millis(100);
    config.transport.chunk_size = 1000;
    config.transport.max_parallel_chunks = 4;
    config.transport.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.transport.token_cache = TokenCacheConfig::default();
    config.limits.max_jobs_per_owner = 2;
    config.limits.max_queued_per_owner = 8;
    config.limits.cancel_grace = Duration::from_millis(500);
    config.reporter.update_interval = Duration::from_millis(50);
    config
}

/// Helper to create a test MediaRelay instance backed by an in-memory
/// platform client. Returns the relay, the client (for seeding/injection),
/// and the tempdir (which must be kept alive).
pub(crate) async fn create_test_relay() -> (MediaRelay, Arc<InMemoryChunkClient>, tempfile::TempDir)
{
    create_test_relay_with(|_| {}).await
}

/// Like [`create_test_relay`] but lets the test adjust the config first.
pub(crate) async fn create_test_relay_with<F>(
    tweak: F,
) -> (MediaRelay, Arc<InMemoryChunkClient>, tempfile::TempDir)
where
    F: FnOnce(&mut Config),
{
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(temp_dir.path());
    tweak(&mut config);

    let client = Arc::new(InMemoryChunkClient::new());
    let relay = MediaRelay::new(config, client.clone() as Arc<dyn crate::transport::ChunkClient>)
        .await
        .unwrap();

    (relay, client, temp_dir)
}

/// Default target for test submissions.
pub(crate) fn test_target() -> TargetDescriptor {
    TargetDescriptor {
        chat_id: 1,
        filename: None,
        caption: None,
    }
}

/// Await the terminal event for a job, returning its final state.
pub(crate) async fn wait_for_terminal(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: JobId,
    timeout: Duration,
) -> JobState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for job {id} to reach a terminal state"));
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(Event::Completed { id: done, .. })) if done == id => {
                return JobState::Completed;
            }
            Ok(Ok(Event::Failed { id: done, .. })) if done == id => return JobState::Failed,
            Ok(Ok(Event::Cancelled { id: done })) if done == id => return JobState::Cancelled,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("event channel closed while waiting for job {id}: {e}"),
            Err(_) => panic!("timed out waiting for job {id} to reach a terminal state"),
        }
    }
}

/// Number of `job_*` staging directories left on disk.
pub(crate) fn staging_dir_count(staging_root: &std::path::Path) -> usize {
    std::fs::read_dir(staging_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("job_"))
                .count()
        })
        .unwrap_or(0)
}
