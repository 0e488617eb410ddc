//! # media-relay
//!
//! Embeddable media transfer pipeline for chat-platform bots.
//!
//! A transfer job fetches source media (HTTP or the platform itself),
//! optionally normalizes it with an external media tool, and delivers it
//! to the chat platform in size-limited, resumable chunks — with per-owner
//! concurrency limits, throttled progress reporting, and cleanup on every
//! failure path.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Typed failures** - Every component reports typed errors upward; the
//!   coordinator is the only place they become user-visible status
//! - **Nothing persists** - The job table lives in memory; staged files
//!   never outlive their job
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use media_relay::{
//!     Config, InMemoryChunkClient, MediaProfile, MediaRelay, OwnerId,
//!     SourceDescriptor, TargetDescriptor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The real platform client is supplied by the embedding bot
//!     let client = Arc::new(InMemoryChunkClient::new());
//!     let relay = MediaRelay::new(Config::default(), client).await?;
//!
//!     // Subscribe to events
//!     let mut events = relay.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let job_id = relay
//!         .submit(
//!             OwnerId::new(42),
//!             SourceDescriptor::Url {
//!                 url: url::Url::parse("https://example.com/video.mkv")?,
//!             },
//!             TargetDescriptor {
//!                 chat_id: 42,
//!                 filename: None,
//!                 caption: Some("encoded for you".to_string()),
//!             },
//!             Some(MediaProfile::Video720p),
//!         )
//!         .await?;
//!     println!("submitted job {job_id}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Source fetcher (HTTP streaming into staging)
pub mod fetch;
/// Job coordinator
pub mod relay;
/// Throttled progress reporting
pub mod reporter;
/// Retry logic with exponential backoff
pub mod retry;
/// Per-job staging area management
pub mod staging;
/// Transcoder adapter (external media tool)
pub mod transcode;
/// Chunked transport to the chat platform
pub mod transport;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, LimitsConfig, RetryConfig, TransportConfig};
pub use error::{
    AdmissionError, Error, FetchError, Result, TranscodeError, TransportError,
};
pub use relay::MediaRelay;
pub use reporter::{StatusLine, spawn_status_reporter};
pub use staging::{StagedFile, StagingArea, StagingSlot};
pub use transcode::{AudioFormat, MediaProfile, TranscodeSpec, Transcoder};
pub use transport::{
    ChunkClient, ChunkDescriptor, ChunkPlan, ChunkStatus, ChunkUpload, ChunkedTransport,
    InMemoryChunkClient, UploadManifest,
};
pub use types::{
    ChunkToken, Event, JobId, JobInfo, JobState, OwnerId, Phase, PipelineStats,
    ProgressSnapshot, RemoteFileId, SourceDescriptor, TargetDescriptor,
};

/// Helper function to run the pipeline with graceful signal handling.
///
/// Waits for a termination signal and then calls the relay's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use media_relay::{Config, InMemoryChunkClient, MediaRelay, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Arc::new(InMemoryChunkClient::new());
///     let relay = MediaRelay::new(Config::default(), client).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(relay).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(relay: MediaRelay) -> Result<()> {
    wait_for_signal().await;
    relay.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
