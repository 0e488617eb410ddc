//! Per-job staging area management
//!
//! Each transfer job receives an exclusive subdirectory under the staging
//! root for the span of its pipeline. Slots are purged when the job reaches
//! a terminal state; the coordinator guarantees this on every exit path.

use std::path::{Path, PathBuf};

use crate::config::StagingConfig;
use crate::error::{Error, Result};
use crate::types::JobId;

/// A file staged between pipeline phases
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedFile {
    /// Absolute path inside a staging slot
    pub path: PathBuf,
    /// Size in bytes at staging time
    pub size_bytes: u64,
}

impl StagedFile {
    /// Build a StagedFile by stat-ing an existing path
    pub async fn from_path(path: PathBuf) -> Result<Self> {
        let meta = tokio::fs::metadata(&path).await?;
        Ok(Self {
            path,
            size_bytes: meta.len(),
        })
    }
}

/// The staging filesystem area shared by all jobs
///
/// Only slot allocation is shared; each slot is an exclusive subdirectory
/// and no two jobs ever touch the same slot.
#[derive(Clone, Debug)]
pub struct StagingArea {
    root: PathBuf,
    config: StagingConfig,
}

impl StagingArea {
    /// Create the staging area, ensuring the root directory exists
    pub async fn new(config: StagingConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create staging root '{}': {}",
                        config.root_dir.display(),
                        e
                    ),
                ))
            })?;
        Ok(Self {
            root: config.root_dir.clone(),
            config,
        })
    }

    /// Staging root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate the exclusive slot for a job, creating its directory
    pub async fn allocate(&self, job_id: JobId) -> Result<StagingSlot> {
        let dir = self.root.join(format!("job_{}", job_id.0));
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(job_id = job_id.0, dir = %dir.display(), "Allocated staging slot");
        Ok(StagingSlot { job_id, dir })
    }

    /// Verify the staging filesystem can hold `expected_bytes` more data
    ///
    /// Applies the configured size multiplier (source plus transcoded output
    /// plus slack) and the minimum free-space reserve. A no-op when space
    /// checking is disabled or the expected size is unknown (zero).
    pub fn ensure_space(&self, expected_bytes: u64) -> Result<()> {
        if !self.config.check_free_space || expected_bytes == 0 {
            return Ok(());
        }

        let required = (expected_bytes as f64 * self.config.size_multiplier) as u64;
        let required_with_reserve = required.saturating_add(self.config.min_free_space);

        let available = crate::utils::available_space(&self.root)
            .map_err(|e| Error::SpaceCheckFailed(e.to_string()))?;

        if available < required_with_reserve {
            return Err(Error::InsufficientSpace {
                required: required_with_reserve,
                available,
            });
        }
        Ok(())
    }
}

/// Exclusive per-job staging directory
///
/// The slot does not remove itself on drop; purging is an explicit
/// coordinator responsibility so that failure paths can log the outcome.
#[derive(Clone, Debug)]
pub struct StagingSlot {
    job_id: JobId,
    dir: PathBuf,
}

impl StagingSlot {
    /// The slot's directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a named file inside the slot
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Remove the slot directory and everything in it
    ///
    /// Idempotent: a missing directory is not an error.
    pub async fn purge(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                tracing::debug!(job_id = self.job_id.0, dir = %self.dir.display(), "Purged staging slot");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    job_id = self.job_id.0,
                    dir = %self.dir.display(),
                    error = %e,
                    "Failed to purge staging slot"
                );
            }
        }
    }
}
