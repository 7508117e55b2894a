//! Backend over a local directory tree.

use super::{Backend, ListOptions, WriteOptions};
use crate::paths;
use crate::utils::errors::{CleanerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

/// Serves backend paths from below `root`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let relative = paths::normalize(path);
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// Map an I/O error to the cleaner taxonomy, keeping "missing" distinct.
fn map_io(path: &str, e: std::io::Error) -> CleanerError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::NotADirectory => CleanerError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => CleanerError::AlreadyExists(path.to_string()),
        _ => CleanerError::Io(e),
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.full_path(dir)).await {
            Ok(entries) => entries,
            Err(e) => {
                let err = map_io(dir, e);
                if options.ignore_missing && err.is_not_found() {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(dir, e))? {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                // Backend paths are UTF-8; such a file cannot be addressed.
                Err(name) => warn!(dir = %dir, name = ?name, "Skipping non-UTF-8 file name"),
            }
        }
        names.sort();

        if options.prepend_dir {
            Ok(names.iter().map(|name| paths::join(dir, name)).collect())
        } else {
            Ok(names)
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let data = tokio::fs::read(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_file(&self, path: &str, data: Bytes, options: WriteOptions) -> Result<()> {
        let full = self.full_path(path);
        self.ensure_parent(&full).await?;

        let mut open = tokio::fs::OpenOptions::new();
        open.write(true);
        if options.overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }

        let mut file = open.open(&full).await.map_err(|e| map_io(path, e))?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.full_path(to);
        self.ensure_parent(&target).await?;
        tokio::fs::rename(self.full_path(from), target)
            .await
            .map_err(|e| map_io(from, e))
    }

    async fn get_size(&self, path: &str) -> Result<u64> {
        let metadata = tokio::fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(metadata.len())
    }
}
