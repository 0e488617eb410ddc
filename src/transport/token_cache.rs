//! Resumable chunk-token cache
//!
//! Whether chunk tokens survive across upload attempts depends on the
//! platform protocol, so caching is an explicit opt-in
//! ([`TokenCacheConfig::enabled`](crate::config::TokenCacheConfig)).
//! Entries are keyed by `(job id, chunk index)`, live for a bounded
//! retention window, and are evicted explicitly when the job completes or
//! fails.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::TokenCacheConfig;
use crate::types::{ChunkToken, JobId};

/// In-process `(job, chunk) -> token` cache with bounded retention
#[derive(Debug)]
pub struct TokenCache {
    enabled: bool,
    retention: Duration,
    entries: std::sync::Mutex<HashMap<(JobId, u32), (ChunkToken, Instant)>>,
}

impl TokenCache {
    /// Create a cache from config; a disabled cache stores nothing
    pub fn new(config: &TokenCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            retention: config.retention,
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Record a token for a successfully acknowledged chunk
    pub fn insert(&self, job_id: JobId, index: u32, token: ChunkToken) {
        if !self.enabled {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((job_id, index), (token, Instant::now()));
        }
    }

    /// Look up a still-valid token; expired entries are dropped on access
    pub fn get(&self, job_id: JobId, index: u32) -> Option<ChunkToken> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock().ok()?;
        match entries.get(&(job_id, index)) {
            Some((token, inserted)) if inserted.elapsed() < self.retention => Some(token.clone()),
            Some(_) => {
                entries.remove(&(job_id, index));
                None
            }
            None => None,
        }
    }

    /// Drop every entry belonging to a job (completion, failure, cancel)
    pub fn evict_job(&self, job_id: JobId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(job, _), _| *job != job_id);
        }
    }

    /// Number of live entries (expired entries may still be counted until
    /// their next access)
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
