//! Source fetcher — streams remote media into a staging slot
//!
//! Media can exceed available memory, so the body is always streamed to
//! disk. Progress snapshots are emitted at a bounded rate so the reporter
//! is never flooded.

use std::time::Instant;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::staging::{StagedFile, StagingSlot};
use crate::types::{JobId, Phase, ProgressSnapshot};

/// Gate limiting how often progress snapshots are emitted.
///
/// An emission passes only when the configured interval has elapsed since
/// the last one, and — when a total is known — the completion percentage has
/// advanced by at least the configured step. The final snapshot of a phase
/// bypasses the gate.
pub(crate) struct ProgressGate {
    min_interval: std::time::Duration,
    min_percent_step: f64,
    last_emit: Option<Instant>,
    last_fraction: f64,
}

impl ProgressGate {
    pub(crate) fn new(min_interval: std::time::Duration, min_percent_step: f64) -> Self {
        Self {
            min_interval,
            min_percent_step,
            last_emit: None,
            last_fraction: 0.0,
        }
    }

    /// Whether a snapshot at `bytes_done` of `bytes_total` should be emitted now
    pub(crate) fn should_emit(&mut self, bytes_done: u64, bytes_total: Option<u64>) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.min_interval
        {
            return false;
        }

        if let Some(total) = bytes_total.filter(|t| *t > 0) {
            let fraction = bytes_done as f64 / total as f64;
            if (fraction - self.last_fraction) * 100.0 < self.min_percent_step {
                return false;
            }
            self.last_fraction = fraction;
        }

        self.last_emit = Some(now);
        true
    }
}

/// Streams source media over HTTP into staging slots
#[derive(Clone, Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    /// Create a fetcher with the configured timeouts
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    /// Fetch `url` into the job's staging slot
    ///
    /// Writes only inside the slot assigned by the coordinator. Emits
    /// phase=fetch progress snapshots through `progress_tx` at a bounded
    /// rate. Errors distinguish retryable (`Timeout`, `Network`) from
    /// terminal (`NotFound`, `SizeLimitExceeded`) conditions.
    pub async fn fetch(
        &self,
        url: &url::Url,
        slot: &StagingSlot,
        job_id: JobId,
        progress_tx: &tokio::sync::mpsc::Sender<ProgressSnapshot>,
    ) -> Result<StagedFile, FetchError> {
        let url_str = url.to_string();
        tracing::info!(job_id = job_id.0, url = %url_str, "Fetching source media");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&url_str, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound { url: url_str });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                url: url_str,
                message: format!("unexpected status {status}"),
            });
        }

        // Reject oversized sources up front when the server declares a length
        let declared_len = response.content_length();
        if let Some(len) = declared_len
            && len > self.config.max_file_size
        {
            return Err(FetchError::SizeLimitExceeded {
                limit: self.config.max_file_size,
                actual: len,
            });
        }

        let filename = filename_from_url(url);
        let dest = slot.file(&filename);
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| FetchError::Network {
                url: url_str.clone(),
                message: format!("failed to create staged file: {e}"),
            })?;

        let mut gate = ProgressGate::new(
            self.config.progress_interval,
            self.config.progress_percent_step,
        );
        let mut bytes_done: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            // Idle sources are a timeout, not an indefinite hang
            let next = tokio::time::timeout(self.config.read_timeout, stream.next()).await;
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(classify_reqwest_error(&url_str, e)),
                Ok(None) => break,
                Err(_) => return Err(FetchError::Timeout { url: url_str }),
            };

            bytes_done += chunk.len() as u64;
            if bytes_done > self.config.max_file_size {
                return Err(FetchError::SizeLimitExceeded {
                    limit: self.config.max_file_size,
                    actual: bytes_done,
                });
            }

            file.write_all(&chunk).await.map_err(|e| FetchError::Network {
                url: url_str.clone(),
                message: format!("failed to write staged file: {e}"),
            })?;

            if gate.should_emit(bytes_done, declared_len) {
                let _ = progress_tx
                    .send(ProgressSnapshot::now(
                        job_id,
                        Phase::Fetch,
                        bytes_done,
                        declared_len,
                    ))
                    .await;
            }
        }

        file.flush().await.map_err(|e| FetchError::Network {
            url: url_str.clone(),
            message: format!("failed to flush staged file: {e}"),
        })?;
        drop(file);

        // Final snapshot bypasses the gate so consumers always see 100%
        let _ = progress_tx
            .send(ProgressSnapshot::now(
                job_id,
                Phase::Fetch,
                bytes_done,
                Some(bytes_done),
            ))
            .await;

        tracing::info!(
            job_id = job_id.0,
            size_bytes = bytes_done,
            path = %dest.display(),
            "Source media staged"
        );

        Ok(StagedFile {
            path: dest,
            size_bytes: bytes_done,
        })
    }
}

/// Map a reqwest error onto the fetch taxonomy
fn classify_reqwest_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

/// Derive a staging filename from the last URL path segment
fn filename_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "source.bin".to_string())
}
