//! Chat-platform client boundary
//!
//! The pipeline drives the platform's upload/download primitives through
//! the [`ChunkClient`] trait; the embedding bot supplies the real client.
//! The core never manages platform authentication or connection setup, and
//! must not assume exclusive access to the connection — the client's own
//! multiplexing handles concurrent calls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::TransportError;
use crate::types::{ChunkToken, RemoteFileId, TargetDescriptor};

/// One chunk handed to the platform client for upload
///
/// The client reads the byte range itself, so multi-gigabyte chunks are
/// never buffered by the pipeline.
#[derive(Clone, Debug)]
pub struct ChunkUpload {
    /// 0-based sequence index
    pub index: u32,
    /// Byte offset into the staged file
    pub offset: u64,
    /// Byte length of the chunk
    pub len: u64,
    /// Staged file the range belongs to
    pub path: PathBuf,
    /// Filename presented to the platform
    pub filename: String,
}

/// Whole-file metadata passed to finalize
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadManifest {
    /// Filename presented to the platform
    pub filename: String,
    /// Total file size in bytes
    pub total_size: u64,
    /// Hex-encoded SHA-256 of the whole file
    pub sha256: String,
    /// Optional caption attached to the committed file
    pub caption: Option<String>,
}

/// Platform upload/download primitives supplied by the embedding client
#[async_trait]
pub trait ChunkClient: Send + Sync {
    /// Upload one chunk, returning its opaque token on acknowledgement
    async fn send_chunk(
        &self,
        target: &TargetDescriptor,
        chunk: &ChunkUpload,
    ) -> Result<ChunkToken, TransportError>;

    /// Commit previously-uploaded chunks into one addressable remote file
    ///
    /// Tokens are always passed in ascending sequence order.
    async fn finalize_upload(
        &self,
        target: &TargetDescriptor,
        tokens: &[ChunkToken],
        manifest: &UploadManifest,
    ) -> Result<RemoteFileId, TransportError>;

    /// Download one byte range of a remote file
    async fn download_chunk(
        &self,
        remote: &RemoteFileId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, TransportError>;

    /// Total size of a remote file in bytes
    async fn remote_len(&self, remote: &RemoteFileId) -> Result<u64, TransportError>;
}

/// In-memory [`ChunkClient`] for tests and embedding demos
///
/// Behaves like a strict platform: finalize rejects token sequences that
/// are out of order, incomplete, or inconsistent with the manifest, so
/// ordering bugs surface as [`TransportError::PlatformRejected`]. Per-chunk
/// latency and transient-failure injection make completion-order and retry
/// behavior testable.
#[derive(Default)]
pub struct InMemoryChunkClient {
    inner: std::sync::Mutex<ClientState>,
    token_counter: AtomicU64,
}

#[derive(Default)]
struct ClientState {
    /// token -> (chunk index, chunk bytes)
    pending: HashMap<String, (u32, Vec<u8>)>,
    /// Committed remote files
    remotes: HashMap<String, Vec<u8>>,
    /// Artificial latency per chunk index
    delays: HashMap<u32, Duration>,
    /// Remaining transient failures per chunk index
    fail_transient: HashMap<u32, u32>,
    /// Chunk indexes that always fail terminally
    fail_terminal: std::collections::HashSet<u32>,
    /// Indexes attempted via send_chunk, in call order
    attempts: Vec<u32>,
}

impl InMemoryChunkClient {
    /// Create an empty client
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay acknowledgement of `index` by `delay`
    pub fn set_chunk_delay(&self, index: u32, delay: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.delays.insert(index, delay);
        }
    }

    /// Fail the first `count` attempts of `index` with a transient error
    pub fn fail_transient(&self, index: u32, count: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_transient.insert(index, count);
        }
    }

    /// Always reject `index` with a terminal platform error
    pub fn fail_terminal(&self, index: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_terminal.insert(index);
        }
    }

    /// Seed a committed remote file for download tests
    pub fn seed_remote(&self, id: &RemoteFileId, bytes: Vec<u8>) {
        if let Ok(mut state) = self.inner.lock() {
            state.remotes.insert(id.0.clone(), bytes);
        }
    }

    /// Bytes of a committed remote file
    pub fn remote_bytes(&self, id: &RemoteFileId) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.remotes.get(&id.0).cloned()
    }

    /// Chunk indexes attempted so far, in call order
    pub fn attempted_indexes(&self) -> Vec<u32> {
        self.inner
            .lock()
            .map(|state| state.attempts.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ClientState>, TransportError> {
        self.inner.lock().map_err(|_| TransportError::Network {
            message: "client state poisoned".to_string(),
        })
    }
}

#[async_trait]
impl ChunkClient for InMemoryChunkClient {
    async fn send_chunk(
        &self,
        _target: &TargetDescriptor,
        chunk: &ChunkUpload,
    ) -> Result<ChunkToken, TransportError> {
        let delay = {
            let mut state = self.lock()?;
            state.attempts.push(chunk.index);

            if state.fail_terminal.contains(&chunk.index) {
                return Err(TransportError::PlatformRejected {
                    message: format!("chunk {} rejected", chunk.index),
                });
            }
            if let Some(remaining) = state.fail_transient.get_mut(&chunk.index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Network {
                        message: format!("injected transient failure for chunk {}", chunk.index),
                    });
                }
            }
            state.delays.get(&chunk.index).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Read the byte range exactly as a real client would
        let mut file = tokio::fs::File::open(&chunk.path)
            .await
            .map_err(|e| TransportError::Network {
                message: format!("failed to open staged file: {e}"),
            })?;
        file.seek(std::io::SeekFrom::Start(chunk.offset))
            .await
            .map_err(|e| TransportError::Network {
                message: format!("failed to seek staged file: {e}"),
            })?;
        let mut data = vec![0u8; chunk.len as usize];
        file.read_exact(&mut data)
            .await
            .map_err(|e| TransportError::Network {
                message: format!("failed to read chunk range: {e}"),
            })?;

        let token = ChunkToken(format!(
            "tok-{}-{}",
            chunk.index,
            self.token_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let mut state = self.lock()?;
        state.pending.insert(token.0.clone(), (chunk.index, data));
        Ok(token)
    }

    async fn finalize_upload(
        &self,
        target: &TargetDescriptor,
        tokens: &[ChunkToken],
        manifest: &UploadManifest,
    ) -> Result<RemoteFileId, TransportError> {
        let mut state = self.lock()?;

        if tokens.is_empty() {
            return Err(TransportError::PlatformRejected {
                message: "finalize with no chunk tokens".to_string(),
            });
        }

        let mut assembled = Vec::with_capacity(manifest.total_size as usize);
        let mut expected_index = 0u32;
        for token in tokens {
            let (index, data) =
                state
                    .pending
                    .remove(&token.0)
                    .ok_or_else(|| TransportError::PlatformRejected {
                        message: format!("unknown chunk token {}", token.0),
                    })?;
            if index != expected_index {
                return Err(TransportError::PlatformRejected {
                    message: format!(
                        "chunk tokens out of order: expected index {expected_index}, got {index}"
                    ),
                });
            }
            expected_index += 1;
            assembled.extend_from_slice(&data);
        }

        if assembled.len() as u64 != manifest.total_size {
            return Err(TransportError::PlatformRejected {
                message: format!(
                    "assembled size {} does not match manifest {}",
                    assembled.len(),
                    manifest.total_size
                ),
            });
        }

        let remote_id = format!("remote-{}-{}", target.chat_id, manifest.sha256);
        state.remotes.insert(remote_id.clone(), assembled);
        Ok(RemoteFileId(remote_id))
    }

    async fn download_chunk(
        &self,
        remote: &RemoteFileId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.lock()?;
        let bytes = state
            .remotes
            .get(&remote.0)
            .ok_or_else(|| TransportError::PlatformRejected {
                message: format!("unknown remote file {remote}"),
            })?;

        let start = offset as usize;
        let end = (offset + len) as usize;
        if end > bytes.len() {
            return Err(TransportError::PlatformRejected {
                message: format!("range {start}..{end} out of bounds for {}", bytes.len()),
            });
        }
        Ok(bytes[start..end].to_vec())
    }

    async fn remote_len(&self, remote: &RemoteFileId) -> Result<u64, TransportError> {
        let state = self.lock()?;
        state
            .remotes
            .get(&remote.0)
            .map(|b| b.len() as u64)
            .ok_or_else(|| TransportError::PlatformRejected {
                message: format!("unknown remote file {remote}"),
            })
    }
}
