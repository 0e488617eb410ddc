//! Chunked upload — bounded parallelism, per-chunk retry, in-order finalize

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::{Error, Result, TransportError};
use crate::retry::with_retry;
use crate::staging::StagedFile;
use crate::types::{ChunkToken, Event, JobId, Phase, ProgressSnapshot, RemoteFileId, TargetDescriptor};

use super::client::{ChunkClient, ChunkUpload, UploadManifest};
use super::plan::{ChunkPlan, OrderedTokenCollector};
use super::token_cache::TokenCache;

/// Hash buffer size for the whole-file digest
const DIGEST_BUF_SIZE: usize = 65_536;

pub(super) struct UploadParams<'a> {
    pub client: &'a Arc<dyn ChunkClient>,
    pub config: &'a TransportConfig,
    pub token_cache: &'a TokenCache,
    pub event_tx: &'a tokio::sync::broadcast::Sender<Event>,
    pub staged: &'a StagedFile,
    pub target: &'a TargetDescriptor,
    pub job_id: JobId,
    pub progress_tx: &'a tokio::sync::mpsc::Sender<ProgressSnapshot>,
    pub cancel: &'a CancellationToken,
}

/// Upload a staged file as size-limited chunks and finalize it
///
/// Chunks transfer with bounded parallelism; completions may arrive in any
/// order but finalize always receives tokens in ascending sequence order.
/// On failure, acquired tokens are discarded and the cache evicted.
pub(super) async fn upload(params: UploadParams<'_>) -> Result<RemoteFileId> {
    let UploadParams {
        client,
        config,
        token_cache,
        event_tx,
        staged,
        target,
        job_id,
        progress_tx,
        cancel,
    } = params;

    if staged.size_bytes == 0 {
        return Err(TransportError::PlatformRejected {
            message: "refusing to upload an empty file".to_string(),
        }
        .into());
    }

    let plan = ChunkPlan::compute(staged.size_bytes, config.chunk_size)?;
    let total_chunks = plan.len() as u32;
    let filename = upload_filename(staged, target);

    let sha256 = digest_file(&staged.path).await?;
    let manifest = UploadManifest {
        filename: filename.clone(),
        total_size: staged.size_bytes,
        sha256,
        caption: target.caption.clone(),
    };

    tracing::info!(
        job_id = job_id.0,
        chunks = total_chunks,
        total_bytes = staged.size_bytes,
        chunk_limit = config.chunk_size,
        "Starting chunked upload"
    );

    let acked_bytes = Arc::new(AtomicU64::new(0));

    // Dispatch chunks with bounded parallelism; the cancellation token is
    // observed at every chunk boundary, so a cancel stops new dispatches
    // while in-flight chunks drain.
    let mut results = stream::iter(plan.chunks().to_vec())
        .map(|descriptor| {
            let chunk = ChunkUpload {
                index: descriptor.index,
                offset: descriptor.offset,
                len: descriptor.len,
                path: staged.path.clone(),
                filename: filename.clone(),
            };
            let acked_bytes = Arc::clone(&acked_bytes);
            async move {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let token = send_one_chunk(client, config, token_cache, target, job_id, &chunk)
                    .await?;

                let done = acked_bytes.fetch_add(chunk.len, Ordering::Relaxed) + chunk.len;
                event_tx
                    .send(Event::ChunkUploaded {
                        id: job_id,
                        index: chunk.index,
                        total: total_chunks,
                    })
                    .ok();
                let _ = progress_tx
                    .send(ProgressSnapshot::now(
                        job_id,
                        Phase::Upload,
                        done,
                        Some(staged.size_bytes),
                    ))
                    .await;

                Ok::<(u32, ChunkToken), Error>((chunk.index, token))
            }
        })
        .buffer_unordered(config.max_parallel_chunks);

    // Buffer out-of-order completions; only the next-expected index commits
    let mut collector = OrderedTokenCollector::new();
    let mut first_error: Option<Error> = None;

    while let Some(result) = results.next().await {
        match result {
            Ok((index, token)) => collector.push(index, token),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                // Keep draining so in-flight chunks settle before cleanup
            }
        }
    }
    drop(results);

    if let Some(err) = first_error {
        // Acquired tokens are discarded with the job's cache entries
        token_cache.evict_job(job_id);
        return Err(err);
    }

    let tokens = collector
        .finish(total_chunks as usize)
        .ok_or_else(|| TransportError::ChunkFailed {
            index: 0,
            attempts: 0,
            message: "chunk completion accounting mismatch".to_string(),
        })?;

    let remote_id = with_retry(&config.retry, || {
        client.finalize_upload(target, &tokens, &manifest)
    })
    .await
    .map_err(Error::Transport)?;

    token_cache.evict_job(job_id);

    tracing::info!(
        job_id = job_id.0,
        remote_id = %remote_id,
        chunks = total_chunks,
        "Upload finalized"
    );

    Ok(remote_id)
}

/// Send one chunk with its own retry budget, consulting the token cache
async fn send_one_chunk(
    client: &Arc<dyn ChunkClient>,
    config: &TransportConfig,
    token_cache: &TokenCache,
    target: &TargetDescriptor,
    job_id: JobId,
    chunk: &ChunkUpload,
) -> Result<ChunkToken> {
    if let Some(token) = token_cache.get(job_id, chunk.index) {
        tracing::debug!(
            job_id = job_id.0,
            chunk_index = chunk.index,
            "Reusing cached chunk token"
        );
        return Ok(token);
    }

    let result = with_retry(&config.retry, || client.send_chunk(target, chunk)).await;

    match result {
        Ok(token) => {
            token_cache.insert(job_id, chunk.index, token.clone());
            Ok(token)
        }
        // A still-transient error here means the retry budget ran out
        Err(e) if e.is_retryable() => Err(TransportError::ChunkFailed {
            index: chunk.index,
            attempts: config.retry.max_attempts + 1,
            message: e.to_string(),
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}

/// Filename presented to the platform
fn upload_filename(staged: &StagedFile, target: &TargetDescriptor) -> String {
    target
        .filename
        .clone()
        .or_else(|| {
            staged
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "upload.bin".to_string())
}

/// Streamed SHA-256 of a staged file (single pass, 64 KiB buffer)
pub(super) async fn digest_file(path: &std::path::Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = [0u8; DIGEST_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // write! to a String cannot fail
        let _ = write!(out, "{b:02x}");
    }
    out
}
