//! Per-owner admission control
//!
//! The per-owner concurrency counter lives behind a single lock: one keyed
//! map of fair semaphores. A job task blocks here, still in Queued state,
//! until its owner's concurrent-job count drops below the configured limit.
//! Tokio semaphores queue waiters fairly, so admission among one owner's
//! queued jobs is first-submitted-first-run; there is no cross-owner
//! priority beyond arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::types::OwnerId;

/// Keyed fair-FIFO admission gate
#[derive(Debug)]
pub(crate) struct Admission {
    max_jobs_per_owner: usize,
    semaphores: std::sync::Mutex<HashMap<OwnerId, Arc<Semaphore>>>,
}

impl Admission {
    /// Create an admission gate allowing `max_jobs_per_owner` concurrent
    /// jobs per owner
    pub(crate) fn new(max_jobs_per_owner: usize) -> Self {
        Self {
            max_jobs_per_owner,
            semaphores: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Wait for one of the owner's slots; the returned permit holds the
    /// slot until dropped
    pub(crate) async fn acquire(&self, owner: OwnerId) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut map = self
                .semaphores
                .lock()
                .map_err(|_| Error::ShuttingDown)?;

            // Opportunistically drop gates for owners with no running jobs
            // and no other references, so the map doesn't grow forever
            let limit = self.max_jobs_per_owner;
            map.retain(|_, sem| {
                Arc::strong_count(sem) > 1 || sem.available_permits() < limit
            });

            map.entry(owner)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_jobs_per_owner)))
                .clone()
        };

        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Slots currently free for an owner (the full limit when the owner has
    /// no running jobs)
    pub(crate) fn available_slots(&self, owner: OwnerId) -> usize {
        self.semaphores
            .lock()
            .ok()
            .and_then(|map| map.get(&owner).map(|s| s.available_permits()))
            .unwrap_or(self.max_jobs_per_owner)
    }
}
