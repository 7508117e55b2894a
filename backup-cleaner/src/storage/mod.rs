//! Storage backend contract.
//!
//! The cleaner never touches the filesystem directly: every list, read,
//! write, rename and delete goes through a [`Backend`], so the same engine
//! runs against a local directory, a network share or an object store.

pub mod local;
pub mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Options for [`Backend::list`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Return an empty listing instead of `NotFound` for a missing directory
    pub ignore_missing: bool,

    /// Return `dir/name` instead of bare entry names
    pub prepend_dir: bool,
}

impl ListOptions {
    /// Full paths, missing directories treated as empty.
    pub fn tolerant() -> Self {
        Self {
            ignore_missing: true,
            prepend_dir: true,
        }
    }
}

/// Options for [`Backend::write_file`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Replace an existing file instead of failing with `AlreadyExists`
    pub overwrite: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Entries of `dir` (files and sub-directories), sorted by name.
    async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>>;

    async fn read_file(&self, path: &str) -> Result<Bytes>;

    /// Up to `len` bytes starting at `offset`; short at end of file.
    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes>;

    async fn write_file(&self, path: &str, data: Bytes, options: WriteOptions) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    /// Move `from` to `to`, replacing `to` if it exists.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn get_size(&self, path: &str) -> Result<u64>;
}

/// Delete `path`, treating an already missing file as success.
/// Returns whether a file was actually removed.
pub async fn unlink_if_exists(backend: &dyn Backend, path: &str) -> Result<bool> {
    match backend.unlink(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
