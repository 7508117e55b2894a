//! Disk codec contract.
//!
//! The binary disk format lives behind [`DiskCodec`]: the cleaner only needs
//! to open a disk, read its identity and parent link, compare block contents
//! and ask the codec to fold a chain into its ancestor.

pub mod alias;
pub mod marker;

pub use alias::{rename_disk, resolve_alias, unlink_disk};
pub use marker::MergeMarker;

use crate::paths;
use crate::storage::Backend;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Fixed,
    Dynamic,
    Differencing,
}

/// Options for [`DiskCodec::open`]
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Verify the secondary footer against the primary one. Disks with a
    /// merge in progress legitimately fail this check.
    pub check_secondary_footer: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            check_secondary_footer: true,
        }
    }
}

/// An open disk. Dropping the handle releases it.
#[async_trait]
pub trait DiskHandle: Send + Sync {
    /// Path the disk was opened from (the alias path for aliased disks).
    fn path(&self) -> &str;

    fn kind(&self) -> DiskKind;

    /// Identity from the footer.
    fn id(&self) -> Uuid;

    /// Parent reference as stored in the header, relative to the disk's
    /// directory. Only differencing disks have one.
    fn parent_locator(&self) -> Option<&str>;

    /// Virtual size seen by the guest.
    fn logical_size(&self) -> u64;

    /// Bytes used on the backend, or `None` when only a per-block query
    /// could tell.
    fn on_disk_size(&self) -> Option<u64>;

    /// Blocks present in the allocation table.
    fn allocated_blocks(&self) -> Vec<u32>;

    fn contains_block(&self, block: u32) -> bool;

    async fn read_block(&self, block: u32) -> Result<Bytes>;

    /// Whether every allocated block of `other` is present here with the
    /// same bytes.
    async fn contains_all_data_of(&self, other: &dyn DiskHandle) -> Result<bool> {
        for block in other.allocated_blocks() {
            if !self.contains_block(block) {
                return Ok(false);
            }
            if self.read_block(block).await? != other.read_block(block).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Block counters shared between a running merge and whoever reports on it.
#[derive(Debug, Clone, Default)]
pub struct MergeProgress {
    done: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl MergeProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, blocks: u64) {
        self.total.store(blocks, Ordering::Relaxed);
    }

    pub fn set_done(&self, blocks: u64) {
        self.done.store(blocks, Ordering::Relaxed);
    }

    pub fn advance(&self, blocks: u64) {
        self.done.fetch_add(blocks, Ordering::Relaxed);
    }

    /// `(done, total)`
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Options for [`DiskCodec::merge_chain`]
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub progress: MergeProgress,
}

#[async_trait]
pub trait DiskCodec: Send + Sync {
    /// Open a disk (resolving aliases). Structural problems must surface as
    /// [`CleanerError::CorruptDisk`](crate::CleanerError::CorruptDisk) so
    /// they can be told apart from transient I/O failures.
    async fn open(
        &self,
        backend: &Arc<dyn Backend>,
        path: &str,
        options: OpenOptions,
    ) -> Result<Box<dyn DiskHandle>>;

    /// Fold `children` (oldest first) into `ancestor`, leaving the merged
    /// disk at the ancestor's path. Returns the merged logical size.
    async fn merge_chain(
        &self,
        backend: &Arc<dyn Backend>,
        ancestor: &str,
        children: &[String],
        options: MergeOptions,
    ) -> Result<u64>;
}

/// What the cleaner keeps about a disk once its handle is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub path: String,
    pub id: Uuid,
    pub kind: DiskKind,
    /// Resolved parent path, differencing disks only.
    pub parent: Option<String>,
    pub logical_size: u64,
}

impl DiskRecord {
    pub fn from_handle(handle: &dyn DiskHandle) -> Self {
        let path = handle.path().to_string();
        let parent = match handle.kind() {
            DiskKind::Differencing => handle
                .parent_locator()
                .map(|locator| paths::resolve(paths::dirname(&path), locator)),
            _ => None,
        };

        Self {
            id: handle.id(),
            kind: handle.kind(),
            logical_size: handle.logical_size(),
            parent,
            path,
        }
    }
}
