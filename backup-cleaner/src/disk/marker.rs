//! Interrupted-merge markers.
//!
//! A marker is written next to a chain's ancestor before the merge starts
//! and removed only once the merged disk has replaced the chain. Finding one
//! on a later scan means the merge has to be resumed.

use crate::paths;
use crate::storage::{Backend, WriteOptions};
use crate::utils::errors::{CleanerError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker content, serialized as `.<ancestor>.merge.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMarker {
    /// Chain members, oldest first.
    pub chain: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl MergeMarker {
    pub fn new(chain: Vec<String>) -> Self {
        Self {
            chain,
            started_at: Utc::now(),
        }
    }

    /// Write the marker for `ancestor`. An existing marker is kept as is
    /// (the merge is being resumed); returns whether a new one was created.
    pub async fn create(&self, backend: &dyn Backend, ancestor: &str) -> Result<bool> {
        let data = Bytes::from(serde_json::to_vec(self)?);
        match backend
            .write_file(&paths::marker_path(ancestor), data, WriteOptions::default())
            .await
        {
            Ok(()) => Ok(true),
            Err(CleanerError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn load(backend: &dyn Backend, marker_path: &str) -> Result<Self> {
        let data = backend.read_file(marker_path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}
