//! Merge concurrency limiter.
//!
//! A merge reads and rewrites every block of a chain, so merges are gated
//! by one semaphore the caller owns. Share a scheduler between cleaners to
//! cap merges across several backup directories.

use crate::utils::errors::{CleanerError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of merges in flight.
pub const DEFAULT_MERGE_CONCURRENCY: usize = 1;

#[derive(Debug, Clone)]
pub struct MergeScheduler {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl MergeScheduler {
    /// A scheduler allowing `limit` concurrent merges (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Merges that could start right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a merge slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| CleanerError::Merge(format!("merge scheduler closed: {}", e)))
    }
}

impl Default for MergeScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MERGE_CONCURRENCY)
    }
}
