//! Shared fixtures: a JSON disk codec over the in-memory backend and a
//! backend wrapper that records mutating calls.

#![allow(dead_code)]

use async_trait::async_trait;
use backup_cleaner::disk::{
    resolve_alias, DiskCodec, DiskHandle, DiskKind, MergeMarker, MergeOptions, OpenOptions,
};
use backup_cleaner::storage::{Backend, ListOptions, MemoryBackend, WriteOptions};
use backup_cleaner::{paths, CleanEvent, CleanOptions, CleanReport, CleanerError, RepositoryCleaner};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const VM: &str = "vm";
pub const DISK_DIR: &str = "vm/vdis/job/disk";

/// Full backend path of a disk file in the test disk directory.
pub fn disk(name: &str) -> String {
    paths::join(DISK_DIR, name)
}

/// Full backend path of a file in the VM directory.
pub fn vm_file(name: &str) -> String {
    paths::join(VM, name)
}

/// Disk content as stored by [`FakeCodec`]: a JSON block map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeDisk {
    pub id: Uuid,
    pub kind: DiskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub size: u64,
    pub blocks: BTreeMap<u32, String>,
    #[serde(default = "footer_ok_default")]
    pub footer_ok: bool,
    /// The handle cannot report its stored size without a full read.
    #[serde(default)]
    pub size_unknown: bool,
}

fn footer_ok_default() -> bool {
    true
}

impl FakeDisk {
    pub fn base(blocks: &[(u32, &str)]) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: DiskKind::Dynamic,
            parent: None,
            size: 1 << 30,
            blocks: blocks
                .iter()
                .map(|(block, data)| (*block, data.to_string()))
                .collect(),
            footer_ok: true,
            size_unknown: false,
        }
    }

    /// Differencing disk whose parent locator is `parent` (relative to the
    /// disk's own directory).
    pub fn child(parent: &str, blocks: &[(u32, &str)]) -> Self {
        Self {
            kind: DiskKind::Differencing,
            parent: Some(parent.to_string()),
            ..Self::base(blocks)
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn without_cheap_size(mut self) -> Self {
        self.size_unknown = true;
        self
    }

    pub fn interrupted(mut self) -> Self {
        self.footer_ok = false;
        self
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap())
    }

    pub fn decode(path: &str, data: &[u8]) -> Result<Self, CleanerError> {
        serde_json::from_slice(data).map_err(|e| CleanerError::CorruptDisk {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

struct FakeHandle {
    path: String,
    disk: FakeDisk,
    stored_size: u64,
}

#[async_trait]
impl DiskHandle for FakeHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> DiskKind {
        self.disk.kind
    }

    fn id(&self) -> Uuid {
        self.disk.id
    }

    fn parent_locator(&self) -> Option<&str> {
        self.disk.parent.as_deref()
    }

    fn logical_size(&self) -> u64 {
        self.disk.size
    }

    fn on_disk_size(&self) -> Option<u64> {
        (!self.disk.size_unknown).then_some(self.stored_size)
    }

    fn allocated_blocks(&self) -> Vec<u32> {
        self.disk.blocks.keys().copied().collect()
    }

    fn contains_block(&self, block: u32) -> bool {
        self.disk.blocks.contains_key(&block)
    }

    async fn read_block(&self, block: u32) -> backup_cleaner::Result<Bytes> {
        Ok(self
            .disk
            .blocks
            .get(&block)
            .map(|data| Bytes::from(data.clone()))
            .unwrap_or_default())
    }
}

/// Codec storing disks as [`FakeDisk`] JSON. Merges overlay child blocks
/// onto the ancestor, one block at a time.
#[derive(Default)]
pub struct FakeCodec {
    /// Pause after each merged block.
    pub block_delay: Duration,
    /// Fail every merge after it has started writing.
    pub fail_merges: bool,
}

impl FakeCodec {
    async fn data_path(backend: &dyn Backend, path: &str) -> backup_cleaner::Result<String> {
        if paths::is_alias_file(paths::file_name(path)) {
            resolve_alias(backend, path).await
        } else {
            Ok(path.to_string())
        }
    }

    async fn load(backend: &dyn Backend, path: &str) -> backup_cleaner::Result<(String, FakeDisk)> {
        let data_path = Self::data_path(backend, path).await?;
        let data = backend.read_file(&data_path).await?;
        Ok((data_path.clone(), FakeDisk::decode(&data_path, &data)?))
    }
}

#[async_trait]
impl DiskCodec for FakeCodec {
    async fn open(
        &self,
        backend: &Arc<dyn Backend>,
        path: &str,
        options: OpenOptions,
    ) -> backup_cleaner::Result<Box<dyn DiskHandle>> {
        let (data_path, disk) = Self::load(backend.as_ref(), path).await?;
        if options.check_secondary_footer && !disk.footer_ok {
            return Err(CleanerError::CorruptDisk {
                path: path.to_string(),
                reason: "secondary footer mismatch".to_string(),
            });
        }
        let stored_size = backend.get_size(&data_path).await?;
        Ok(Box::new(FakeHandle {
            path: path.to_string(),
            disk,
            stored_size,
        }))
    }

    async fn merge_chain(
        &self,
        backend: &Arc<dyn Backend>,
        ancestor: &str,
        children: &[String],
        options: MergeOptions,
    ) -> backup_cleaner::Result<u64> {
        let backend = backend.as_ref();
        let (ancestor_data, mut merged) = Self::load(backend, ancestor).await?;

        let mut loaded = Vec::new();
        for child in children {
            loaded.push(Self::load(backend, child).await?.1);
        }
        let total: usize = loaded.iter().map(|child| child.blocks.len()).sum();
        options.progress.set_total(total as u64);

        merged.footer_ok = false;
        backend
            .write_file(&ancestor_data, merged.encode(), WriteOptions { overwrite: true })
            .await?;
        if self.fail_merges {
            return Err(CleanerError::Merge("injected merge failure".to_string()));
        }

        for child in &loaded {
            for (block, data) in &child.blocks {
                merged.blocks.insert(*block, data.clone());
                options.progress.advance(1);
                if !self.block_delay.is_zero() {
                    tokio::time::sleep(self.block_delay).await;
                }
            }
            merged.id = child.id;
            merged.size = child.size;
        }

        merged.footer_ok = true;
        backend
            .write_file(&ancestor_data, merged.encode(), WriteOptions { overwrite: true })
            .await?;
        Ok(merged.size)
    }
}

/// Wraps a [`MemoryBackend`], counting mutating calls. Reads of paths in
/// `failing`, unlinks of paths in `failing_unlinks` and the next
/// `failing_renames` renames fail with a transient I/O error.
#[derive(Default)]
pub struct RecordingBackend {
    pub inner: MemoryBackend,
    writes: AtomicUsize,
    unlinks: AtomicUsize,
    renames: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    failing_unlinks: Mutex<HashSet<String>>,
    failing_renames: AtomicUsize,
}

fn injected(what: &str) -> CleanerError {
    CleanerError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_string()))
}

impl RecordingBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn fail_reads(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn fail_unlinks(&self, path: &str) {
        self.failing_unlinks.lock().unwrap().insert(path.to_string());
    }

    pub fn fail_renames(&self, count: usize) {
        self.failing_renames.store(count, Ordering::SeqCst);
    }

    /// Write, unlink and rename calls so far.
    pub fn mutations(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
            + self.unlinks.load(Ordering::SeqCst)
            + self.renames.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> backup_cleaner::Result<()> {
        if self.failing.lock().unwrap().contains(path) {
            return Err(injected("injected read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn list(&self, dir: &str, options: ListOptions) -> backup_cleaner::Result<Vec<String>> {
        self.inner.list(dir, options).await
    }

    async fn read_file(&self, path: &str) -> backup_cleaner::Result<Bytes> {
        self.check(path)?;
        self.inner.read_file(path).await
    }

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> backup_cleaner::Result<Bytes> {
        self.check(path)?;
        self.inner.read_at(path, offset, len).await
    }

    async fn write_file(
        &self,
        path: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> backup_cleaner::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_file(path, data, options).await
    }

    async fn unlink(&self, path: &str) -> backup_cleaner::Result<()> {
        self.unlinks.fetch_add(1, Ordering::SeqCst);
        if self.failing_unlinks.lock().unwrap().contains(path) {
            return Err(injected("injected unlink failure"));
        }
        self.inner.unlink(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> backup_cleaner::Result<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_renames
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(injected("injected rename failure"));
        }
        self.inner.rename(from, to).await
    }

    async fn get_size(&self, path: &str) -> backup_cleaner::Result<u64> {
        self.inner.get_size(path).await
    }
}

/// A VM backup directory under test.
pub struct Repo {
    pub memory: MemoryBackend,
    pub backend: Arc<RecordingBackend>,
    pub codec: Arc<FakeCodec>,
}

impl Repo {
    pub fn new() -> Self {
        Self::with_codec(FakeCodec::default())
    }

    pub fn with_codec(codec: FakeCodec) -> Self {
        let memory = MemoryBackend::new();
        Self {
            backend: Arc::new(RecordingBackend::new(memory.clone())),
            memory,
            codec: Arc::new(codec),
        }
    }

    pub async fn put_disk(&self, name: &str, disk: &FakeDisk) {
        self.memory.put(&self::disk(name), disk.encode()).await;
    }

    pub async fn read_disk(&self, name: &str) -> FakeDisk {
        let data = self.memory.read_file(&self::disk(name)).await.unwrap();
        FakeDisk::decode(name, &data).unwrap()
    }

    /// Alias `name` in the disk directory pointing at `data/<target>`.
    pub async fn put_alias(&self, name: &str, target: &str) {
        self.memory
            .put(&self::disk(name), format!("data/{}", target))
            .await;
    }

    pub async fn put_marker(&self, name: &str, chain: &[&str]) {
        let marker = MergeMarker::new(chain.iter().map(|c| self::disk(c)).collect());
        self.memory
            .put(
                &paths::marker_path(&self::disk(name)),
                serde_json::to_vec(&marker).unwrap(),
            )
            .await;
    }

    /// Delta backup record referencing disks of the test disk directory.
    pub async fn put_delta(&self, name: &str, disks: &[&str], size: u64) {
        let vhds: BTreeMap<String, String> = disks
            .iter()
            .enumerate()
            .map(|(i, d)| (format!("disk-{}", i), format!("vdis/job/disk/{}", d)))
            .collect();
        let record = serde_json::json!({
            "mode": "delta",
            "size": size,
            "vhds": vhds,
            "jobId": "job",
        });
        self.memory
            .put(&vm_file(name), serde_json::to_vec(&record).unwrap())
            .await;
    }

    pub async fn put_full(&self, name: &str, archive: &str, size: u64) {
        let record = serde_json::json!({
            "mode": "full",
            "size": size,
            "xva": format!("./{}", archive),
        });
        self.memory
            .put(&vm_file(name), serde_json::to_vec(&record).unwrap())
            .await;
    }

    /// A plain tar archive of `blocks` data blocks.
    pub async fn put_archive(&self, name: &str, blocks: usize) {
        let mut data = vec![b'x'; blocks * 512];
        data.extend(vec![0u8; 1024]);
        self.memory.put(&vm_file(name), data).await;
    }

    pub async fn metadata(&self, name: &str) -> serde_json::Value {
        let data = self.memory.read_file(&vm_file(name)).await.unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.memory.exists(path).await
    }

    pub async fn size_of(&self, path: &str) -> u64 {
        self.memory.get_size(path).await.unwrap()
    }

    pub fn cleaner(&self, options: CleanOptions) -> RepositoryCleaner {
        RepositoryCleaner::new(
            Arc::clone(&self.backend) as Arc<dyn Backend>,
            Arc::clone(&self.codec) as Arc<dyn DiskCodec>,
            options,
        )
    }

    pub async fn clean(&self, options: CleanOptions) -> CleanReport {
        self.cleaner(options).clean(VM).await.unwrap()
    }
}

pub fn repair() -> CleanOptions {
    CleanOptions {
        repair: true,
        ..Default::default()
    }
}

pub fn repair_and_merge() -> CleanOptions {
    CleanOptions {
        repair: true,
        merge: true,
        ..Default::default()
    }
}

pub fn read_only() -> CleanOptions {
    CleanOptions {
        merge: true,
        ..Default::default()
    }
}

/// Every event already queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<CleanEvent>) -> Vec<CleanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Messages of the log events on `path`.
pub fn messages_for(events: &[CleanEvent], path: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            CleanEvent::Log {
                message,
                path: Some(p),
                ..
            } if p == path => Some(message.clone()),
            _ => None,
        })
        .collect()
}
