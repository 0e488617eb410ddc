//! Chunked transport — size-limited, resumable transfer to the chat platform
//!
//! Split into focused submodules:
//! - [`plan`] - deterministic chunk planning and in-order token collection
//! - [`client`] - the platform client boundary trait and in-memory double
//! - [`upload`] - bounded-parallel upload with per-chunk retry
//! - [`download`] - parallel part fetches with sequential merge
//! - [`token_cache`] - opt-in resumable chunk-token cache

mod client;
mod download;
mod plan;
mod token_cache;
mod upload;

pub use client::{ChunkClient, ChunkUpload, InMemoryChunkClient, UploadManifest};
pub use plan::{ChunkDescriptor, ChunkPlan, ChunkStatus, OrderedTokenCollector};
pub use token_cache::TokenCache;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::staging::{StagedFile, StagingSlot};
use crate::types::{Event, JobId, ProgressSnapshot, RemoteFileId, TargetDescriptor};

/// Drives the platform client's upload/download primitives with chunk
/// planning, bounded parallelism, retries, and in-order finalize.
pub struct ChunkedTransport {
    client: Arc<dyn ChunkClient>,
    config: TransportConfig,
    token_cache: TokenCache,
    event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl ChunkedTransport {
    /// Create a transport over the supplied platform client
    pub fn new(
        client: Arc<dyn ChunkClient>,
        config: TransportConfig,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        let token_cache = TokenCache::new(&config.token_cache);
        Self {
            client,
            config,
            token_cache,
            event_tx,
        }
    }

    /// Upload a staged file to its target as an ordered chunk sequence
    ///
    /// Returns the remote file identifier from the platform's finalize call.
    pub async fn upload(
        &self,
        staged: &StagedFile,
        target: &TargetDescriptor,
        job_id: JobId,
        progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<RemoteFileId> {
        upload::upload(upload::UploadParams {
            client: &self.client,
            config: &self.config,
            token_cache: &self.token_cache,
            event_tx: &self.event_tx,
            staged,
            target,
            job_id,
            progress_tx,
            cancel,
        })
        .await
    }

    /// Download a remote file into a staging slot
    pub async fn download(
        &self,
        remote: &RemoteFileId,
        slot: &StagingSlot,
        dest_name: &str,
        job_id: JobId,
        progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<StagedFile> {
        download::download(download::DownloadParams {
            client: &self.client,
            config: &self.config,
            remote,
            slot,
            dest_name,
            job_id,
            progress_tx,
            cancel,
        })
        .await
    }

    /// Discard any cached chunk tokens belonging to a job
    pub fn evict_tokens(&self, job_id: JobId) {
        self.token_cache.evict_job(job_id);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, StagingConfig, TokenCacheConfig};
    use crate::error::{Error, TransportError};
    use crate::staging::StagingArea;
    use std::time::Duration;

    fn fast_transport_config(chunk_size: u64) -> TransportConfig {
        TransportConfig {
            chunk_size,
            max_parallel_chunks: 4,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            token_cache: TokenCacheConfig::default(),
        }
    }

    struct Harness {
        client: Arc<InMemoryChunkClient>,
        transport: ChunkedTransport,
        slot: crate::staging::StagingSlot,
        _temp: tempfile::TempDir,
    }

    async fn harness(chunk_size: u64) -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(StagingConfig {
            root_dir: temp.path().to_path_buf(),
            check_free_space: false,
            min_free_space: 0,
            size_multiplier: 1.0,
        })
        .await
        .unwrap();
        let slot = area.allocate(JobId::new(1)).await.unwrap();

        let client = Arc::new(InMemoryChunkClient::new());
        let (event_tx, _rx) = tokio::sync::broadcast::channel(256);
        let transport = ChunkedTransport::new(
            client.clone() as Arc<dyn ChunkClient>,
            fast_transport_config(chunk_size),
            event_tx,
        );

        Harness {
            client,
            transport,
            slot,
            _temp: temp,
        }
    }

    async fn stage_bytes(h: &Harness, bytes: &[u8]) -> StagedFile {
        let path = h.slot.file("staged.bin");
        tokio::fs::write(&path, bytes).await.unwrap();
        StagedFile {
            path,
            size_bytes: bytes.len() as u64,
        }
    }

    fn target() -> TargetDescriptor {
        TargetDescriptor {
            chat_id: 7,
            filename: None,
            caption: None,
        }
    }

    #[tokio::test]
    async fn upload_reassembles_bytes_exactly() {
        let h = harness(1000).await;
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let staged = stage_bytes(&h, &data).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();

        let remote = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap();

        assert_eq!(h.client.remote_bytes(&remote).unwrap(), data);
    }

    #[tokio::test]
    async fn shuffled_completion_order_still_finalizes_ascending() {
        // 5 chunks with inverted latency: chunk 0 completes last. The
        // in-memory client rejects out-of-order finalize, so success here
        // proves the ordering invariant end-to-end.
        let h = harness(100).await;
        for index in 0..5u32 {
            h.client
                .set_chunk_delay(index, Duration::from_millis(u64::from(120 - index * 25)));
        }
        let data = vec![0x5A_u8; 480];
        let staged = stage_bytes(&h, &data).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();

        let remote = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap();
        assert_eq!(h.client.remote_bytes(&remote).unwrap(), data);
    }

    #[tokio::test]
    async fn transient_chunk_failures_are_retried_to_success() {
        let h = harness(100).await;
        h.client.fail_transient(1, 2);
        let data = vec![1u8; 250];
        let staged = stage_bytes(&h, &data).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();

        let remote = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap();
        assert_eq!(h.client.remote_bytes(&remote).unwrap(), data);

        // Chunk 1 was attempted 3 times (2 failures + success)
        let attempts = h
            .client
            .attempted_indexes()
            .iter()
            .filter(|i| **i == 1)
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_chunk_retries_fail_the_upload_as_chunk_failed() {
        let h = harness(100).await;
        // More transient failures than the 3-retry budget allows
        h.client.fail_transient(2, 10);
        let staged = stage_bytes(&h, &[2u8; 350]).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();

        let err = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap_err();
        match err {
            Error::Transport(TransportError::ChunkFailed { index, attempts, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(attempts, 4, "original + 3 retries");
            }
            other => panic!("expected ChunkFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn terminal_platform_error_fails_immediately_without_retries() {
        let h = harness(100).await;
        h.client.fail_terminal(0);
        let staged = stage_bytes(&h, &[3u8; 150]).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();

        let err = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Transport(TransportError::PlatformRejected { .. })
            ),
            "got {err}"
        );

        let attempts = h
            .client
            .attempted_indexes()
            .iter()
            .filter(|i| **i == 0)
            .count();
        assert_eq!(attempts, 1, "terminal errors must not be retried");
    }

    #[tokio::test]
    async fn pre_cancelled_upload_attempts_no_chunks() {
        let h = harness(100).await;
        let staged = stage_bytes(&h, &[4u8; 500]).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err}");
        assert!(
            h.client.attempted_indexes().is_empty(),
            "no chunk may be dispatched after cancellation"
        );
    }

    #[tokio::test]
    async fn empty_staged_file_is_rejected() {
        let h = harness(100).await;
        let staged = stage_bytes(&h, &[]).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let cancel = CancellationToken::new();

        let err = h
            .transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Transport(TransportError::PlatformRejected { .. })
            ),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn download_round_trips_an_uploaded_file() {
        let h = harness(128).await;
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 241) as u8).collect();
        let remote = RemoteFileId("seeded-file".to_string());
        h.client.seed_remote(&remote, data.clone());

        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();
        let staged = h
            .transport
            .download(&remote, &h.slot, "fetched.bin", JobId::new(1), &tx, &cancel)
            .await
            .unwrap();

        assert_eq!(staged.size_bytes, 1000);
        let on_disk = tokio::fs::read(&staged.path).await.unwrap();
        assert_eq!(on_disk, data);

        // Part files are cleaned up after the merge
        let mut dir = tokio::fs::read_dir(h.slot.dir()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert!(
            names.iter().all(|n| !n.contains(".part_")),
            "leftover part files: {names:?}"
        );
    }

    #[tokio::test]
    async fn download_of_unknown_remote_fails_terminally() {
        let h = harness(128).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let cancel = CancellationToken::new();

        let err = h
            .transport
            .download(
                &RemoteFileId("missing".to_string()),
                &h.slot,
                "fetched.bin",
                JobId::new(1),
                &tx,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Transport(TransportError::PlatformRejected { .. })
            ),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn failed_upload_discards_cached_tokens_so_retries_resend() {
        let temp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(StagingConfig {
            root_dir: temp.path().to_path_buf(),
            check_free_space: false,
            min_free_space: 0,
            size_multiplier: 1.0,
        })
        .await
        .unwrap();
        let slot = area.allocate(JobId::new(1)).await.unwrap();

        let client = Arc::new(InMemoryChunkClient::new());
        let mut config = fast_transport_config(100);
        config.token_cache = TokenCacheConfig {
            enabled: true,
            retention: Duration::from_secs(60),
        };
        let (event_tx, _rx) = tokio::sync::broadcast::channel(256);
        let transport = ChunkedTransport::new(
            client.clone() as Arc<dyn ChunkClient>,
            config,
            event_tx,
        );

        let path = slot.file("staged.bin");
        let data = vec![7u8; 300];
        tokio::fs::write(&path, &data).await.unwrap();
        let staged = StagedFile {
            path,
            size_bytes: 300,
        };

        // First attempt: chunk 2 fails terminally after chunks 0/1 acked
        client.fail_terminal(2);
        let (tx, _rx2) = tokio::sync::mpsc::channel(64);
        let cancel = CancellationToken::new();
        let err = transport
            .upload(&staged, &target(), JobId::new(1), &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {err}");

        // Failure evicted the cache, so the retry re-sends everything
        let first_round = client.attempted_indexes().len();
        assert!(first_round >= 3);

        // Tokens acquired before a failure must be discarded, not reused
        let (tx2, _rx3) = tokio::sync::mpsc::channel(64);
        let err2 = transport
            .upload(&staged, &target(), JobId::new(1), &tx2, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err2, Error::Transport(_)));
        assert!(
            client.attempted_indexes().len() > first_round,
            "second attempt must re-send chunks after eviction"
        );
    }
}
