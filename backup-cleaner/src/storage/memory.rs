//! In-memory backend. Directories are implied by the files below them.

use super::{Backend, ListOptions, WriteOptions};
use crate::paths;
use crate::utils::errors::{CleanerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct MemoryBackend {
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` at `path`, replacing any previous content.
    pub async fn put(&self, path: &str, data: impl Into<Bytes>) {
        let mut files = self.files.write().await;
        files.insert(paths::normalize(path), data.into());
    }

    pub async fn exists(&self, path: &str) -> bool {
        let files = self.files.read().await;
        files.contains_key(&paths::normalize(path))
    }

    /// Every stored file path, sorted.
    pub async fn paths(&self) -> Vec<String> {
        let files = self.files.read().await;
        files.keys().cloned().collect()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>> {
        let dir = paths::normalize(dir);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let files = self.files.read().await;
        let names: BTreeSet<String> = files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        if names.is_empty() && !options.ignore_missing {
            return Err(CleanerError::NotFound(dir));
        }

        if options.prepend_dir {
            Ok(names.iter().map(|name| paths::join(&dir, name)).collect())
        } else {
            Ok(names.into_iter().collect())
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let files = self.files.read().await;
        files
            .get(&paths::normalize(path))
            .cloned()
            .ok_or_else(|| CleanerError::NotFound(path.to_string()))
    }

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let data = self.read_file(path).await?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn write_file(&self, path: &str, data: Bytes, options: WriteOptions) -> Result<()> {
        let key = paths::normalize(path);
        let mut files = self.files.write().await;
        if !options.overwrite && files.contains_key(&key) {
            return Err(CleanerError::AlreadyExists(path.to_string()));
        }
        files.insert(key, data);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let mut files = self.files.write().await;
        files
            .remove(&paths::normalize(path))
            .map(|_| ())
            .ok_or_else(|| CleanerError::NotFound(path.to_string()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write().await;
        let data = files
            .remove(&paths::normalize(from))
            .ok_or_else(|| CleanerError::NotFound(from.to_string()))?;
        files.insert(paths::normalize(to), data);
        Ok(())
    }

    async fn get_size(&self, path: &str) -> Result<u64> {
        Ok(self.read_file(path).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_implies_directories() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put("vm/vdis/job/disk/a.vhd", "a").await;
        backend.put("vm/vdis/job/disk/b.vhd", "b").await;
        backend.put("vm/20240101.json", "{}").await;

        assert_eq!(
            backend.list("vm", ListOptions::default()).await?,
            vec!["20240101.json", "vdis"]
        );
        assert_eq!(
            backend.list("vm/vdis/job", ListOptions::tolerant()).await?,
            vec!["vm/vdis/job/disk"]
        );
        assert!(backend
            .list("vm/missing", ListOptions::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(backend.list("vm/missing", ListOptions::tolerant()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_rename_unlink() -> Result<()> {
        let backend = MemoryBackend::new();
        backend
            .write_file("a.vhd", Bytes::from_static(b"a"), WriteOptions::default())
            .await?;
        assert!(backend
            .write_file("a.vhd", Bytes::from_static(b"x"), WriteOptions::default())
            .await
            .is_err());

        backend.put("b.vhd", "b").await;
        backend.rename("a.vhd", "b.vhd").await?;
        assert_eq!(backend.paths().await, vec!["b.vhd"]);
        assert_eq!(backend.read_file("b.vhd").await?, Bytes::from_static(b"a"));

        backend.unlink("b.vhd").await?;
        assert!(!backend.exists("b.vhd").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_at_is_clamped() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put("a.xva", "0123456789").await;
        assert_eq!(backend.read_at("a.xva", 7, 10).await?, Bytes::from_static(b"789"));
        assert_eq!(backend.read_at("a.xva", 20, 10).await?, Bytes::new());
        assert_eq!(backend.get_size("a.xva").await?, 10);
        Ok(())
    }
}
