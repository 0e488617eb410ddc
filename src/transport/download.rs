//! Chunked download — parallel part fetches, sequential in-order merge

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::{Error, Result, TransportError};
use crate::retry::with_retry;
use crate::staging::{StagedFile, StagingSlot};
use crate::types::{JobId, Phase, ProgressSnapshot, RemoteFileId};

use super::client::ChunkClient;
use super::plan::ChunkPlan;

/// Copy buffer size for the sequential merge
const MERGE_BUF_SIZE: usize = 65_536;

pub(super) struct DownloadParams<'a> {
    pub client: &'a Arc<dyn ChunkClient>,
    pub config: &'a TransportConfig,
    pub remote: &'a RemoteFileId,
    pub slot: &'a StagingSlot,
    pub dest_name: &'a str,
    pub job_id: JobId,
    pub progress_tx: &'a tokio::sync::mpsc::Sender<ProgressSnapshot>,
    pub cancel: &'a CancellationToken,
}

/// Download a remote file into the job's staging slot
///
/// Chunks are fetched in parallel to per-chunk part files, then merged
/// sequentially in index order so the staged file is byte-exact. The merged
/// size is verified against the remote length.
pub(super) async fn download(params: DownloadParams<'_>) -> Result<StagedFile> {
    let DownloadParams {
        client,
        config,
        remote,
        slot,
        dest_name,
        job_id,
        progress_tx,
        cancel,
    } = params;

    let total_size = with_retry(&config.retry, || client.remote_len(remote))
        .await
        .map_err(Error::Transport)?;
    let plan = ChunkPlan::compute(total_size, config.chunk_size)?;
    let dest = slot.file(dest_name);

    tracing::info!(
        job_id = job_id.0,
        remote_id = %remote,
        chunks = plan.len(),
        total_bytes = total_size,
        "Starting chunked download"
    );

    let done_bytes = Arc::new(AtomicU64::new(0));

    // Fetch parts with bounded parallelism; cancellation is observed at
    // every chunk boundary.
    let mut results = stream::iter(plan.chunks().to_vec())
        .map(|descriptor| {
            let part_path = slot.file(&format!("{dest_name}.part_{}", descriptor.index));
            let done_bytes = Arc::clone(&done_bytes);
            async move {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let bytes = with_retry(&config.retry, || {
                    client.download_chunk(remote, descriptor.offset, descriptor.len)
                })
                .await
                .map_err(|e| -> Error {
                    if e.is_retryable() {
                        TransportError::ChunkFailed {
                            index: descriptor.index,
                            attempts: config.retry.max_attempts + 1,
                            message: e.to_string(),
                        }
                        .into()
                    } else {
                        e.into()
                    }
                })?;

                tokio::fs::write(&part_path, &bytes).await?;

                let done = done_bytes.fetch_add(descriptor.len, Ordering::Relaxed) + descriptor.len;
                let _ = progress_tx
                    .send(ProgressSnapshot::now(
                        job_id,
                        Phase::Fetch,
                        done,
                        Some(total_size),
                    ))
                    .await;

                Ok::<(u32, std::path::PathBuf), Error>((descriptor.index, part_path))
            }
        })
        .buffer_unordered(config.max_parallel_chunks);

    let mut parts: Vec<(u32, std::path::PathBuf)> = Vec::with_capacity(plan.len());
    let mut first_error: Option<Error> = None;

    while let Some(result) = results.next().await {
        match result {
            Ok(entry) => parts.push(entry),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    drop(results);

    if let Some(err) = first_error {
        for (_, part) in &parts {
            let _ = tokio::fs::remove_file(part).await;
        }
        return Err(err);
    }

    // Sequential merge in ascending index order
    parts.sort_by_key(|(index, _)| *index);
    let mut out = tokio::fs::File::create(&dest).await?;
    for (_, part) in &parts {
        let mut file = tokio::fs::File::open(part).await?;
        let mut buf = [0u8; MERGE_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
        }
    }
    out.flush().await?;
    drop(out);

    for (_, part) in &parts {
        let _ = tokio::fs::remove_file(part).await;
    }

    let staged = StagedFile::from_path(dest).await?;
    if staged.size_bytes != total_size {
        let _ = tokio::fs::remove_file(&staged.path).await;
        return Err(TransportError::PlatformRejected {
            message: format!(
                "downloaded size {} does not match remote length {}",
                staged.size_bytes, total_size
            ),
        }
        .into());
    }

    tracing::info!(
        job_id = job_id.0,
        size_bytes = staged.size_bytes,
        path = %staged.path.display(),
        "Remote file staged"
    );

    Ok(staged)
}
