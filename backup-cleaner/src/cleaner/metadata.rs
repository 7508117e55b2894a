//! Metadata cross-referencer.
//!
//! Backup records (`<vm>/*.json`) decide which disks and archives are still
//! needed. Records pointing at missing files are dropped; everything that no
//! valid record reaches is unused.

use super::graph::DiskGraph;
use super::CleanContext;
use crate::paths;
use crate::storage::{Backend, ListOptions, WriteOptions};
use crate::utils::errors::{CleanerError, Result};
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const TAR_BLOCK_SIZE: u64 = 512;
/// A tar stream ends with two zero-filled blocks.
const TAR_END_SIZE: u64 = 2 * TAR_BLOCK_SIZE;
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
/// Smallest possible compressed archive.
const MIN_COMPRESSED_SIZE: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Delta,
}

/// Fields of a backup record the cleaner cares about. Everything else in
/// the document is preserved untouched on rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupMetadata {
    pub mode: BackupMode,

    #[serde(default)]
    pub size: Option<u64>,

    /// Archive of a full backup, relative to the record.
    #[serde(default)]
    pub xva: Option<String>,

    /// Logical disk id -> disk path relative to the record.
    #[serde(default, alias = "vdis")]
    pub vhds: Option<BTreeMap<String, String>>,
}

/// A parsed record with its references resolved.
#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub path: String,
    /// Raw document, rewritten with only `size` changed.
    pub document: Value,
    pub metadata: BackupMetadata,
    /// Resolved archive path (full backups).
    pub archive: Option<String>,
    /// Resolved disk paths (delta backups).
    pub disks: Vec<String>,
}

impl MetadataRecord {
    pub fn parse(path: &str, data: &[u8]) -> Result<Self> {
        let invalid = |reason: String| CleanerError::InvalidMetadata {
            path: path.to_string(),
            reason,
        };

        let document: Value = serde_json::from_slice(data).map_err(|e| invalid(e.to_string()))?;
        if !document.is_object() {
            return Err(invalid("not a JSON object".to_string()));
        }
        let metadata: BackupMetadata =
            serde_json::from_value(document.clone()).map_err(|e| invalid(e.to_string()))?;

        let base_dir = paths::dirname(path);
        let (archive, disks) = match metadata.mode {
            BackupMode::Full => {
                let xva = metadata
                    .xva
                    .as_deref()
                    .ok_or_else(|| invalid("full backup without archive".to_string()))?;
                (Some(paths::resolve(base_dir, xva)), Vec::new())
            }
            BackupMode::Delta => {
                let vhds = metadata
                    .vhds
                    .as_ref()
                    .filter(|vhds| !vhds.is_empty())
                    .ok_or_else(|| invalid("delta backup without disks".to_string()))?;
                let disks = vhds
                    .values()
                    .map(|disk| paths::resolve(base_dir, disk))
                    .collect();
                (None, disks)
            }
        };

        Ok(Self {
            path: path.to_string(),
            document,
            metadata,
            archive,
            disks,
        })
    }
}

/// Files found directly in the VM directory.
#[derive(Debug, Default, Clone)]
pub struct BackupFiles {
    pub metadata: Vec<String>,
    pub archives: BTreeSet<String>,
    pub checksums: Vec<String>,
}

pub(crate) async fn list_backup_files(ctx: &CleanContext, vm_dir: &str) -> Result<BackupFiles> {
    let entries = ctx.backend.list(vm_dir, ListOptions::tolerant()).await?;

    let mut files = BackupFiles::default();
    for path in entries {
        let name = paths::file_name(&path);
        if paths::is_metadata_file(name) {
            files.metadata.push(path);
        } else if paths::is_archive_file(name) {
            files.archives.insert(path);
        } else if paths::is_checksum_file(name) {
            files.checksums.push(path);
        }
    }

    debug!(
        vm_dir = %vm_dir,
        metadata = files.metadata.len(),
        archives = files.archives.len(),
        "Listed backup files"
    );

    Ok(files)
}

/// Disk references of every readable record, gathered before the graph is
/// built so deduplication never deletes a copy some backup points at.
#[derive(Debug, Default, Clone)]
pub struct DiskReferences {
    records: BTreeMap<String, MetadataRecord>,
    /// Some record could not be read; any disk may be referenced.
    pub incomplete: bool,
}

impl DiskReferences {
    /// Records referencing `disk`.
    pub fn holders<'a>(&'a self, disk: &'a str) -> impl Iterator<Item = &'a MetadataRecord> + 'a {
        self.records
            .values()
            .filter(move |record| record.disks.iter().any(|d| d == disk))
    }

    pub fn get(&self, record_path: &str) -> Option<&MetadataRecord> {
        self.records.get(record_path)
    }
}

/// Read every record once. Unparsable or vanished records are left for
/// [`cross_reference`] to report.
pub(crate) async fn load_references(ctx: &CleanContext, files: &BackupFiles) -> DiskReferences {
    let loaded = join_all(
        files
            .metadata
            .iter()
            .map(|path| load_record(ctx.backend.as_ref(), path)),
    )
    .await;

    let mut references = DiskReferences::default();
    for (path, result) in files.metadata.iter().zip(loaded) {
        match result {
            Ok(record) => {
                references.records.insert(path.clone(), record);
            }
            Err(e) if e.is_not_found() || e.is_structural() => {}
            Err(e) => {
                debug!(path = %path, error = %e, "Backup record unreadable before graph stage");
                references.incomplete = true;
            }
        }
    }
    references
}

/// Rewrite the disk references of `record` according to `moves` (old disk
/// path to new disk path). Only the matching reference values change.
pub(crate) async fn retarget_disks(
    ctx: &CleanContext,
    record: &MetadataRecord,
    moves: &BTreeMap<String, String>,
) -> Result<()> {
    let base_dir = paths::dirname(&record.path);
    let mut document = record.document.clone();
    let mut changed = false;

    for key in ["vhds", "vdis"] {
        let Some(vhds) = document.get_mut(key).and_then(Value::as_object_mut) else {
            continue;
        };
        for reference in vhds.values_mut() {
            let target = reference
                .as_str()
                .and_then(|r| moves.get(&paths::resolve(base_dir, r)));
            if let Some(target) = target {
                *reference = Value::from(paths::relative(base_dir, target));
                changed = true;
            }
        }
    }
    if !changed {
        return Ok(());
    }

    let data = serde_json::to_vec(&document)?;
    ctx.backend
        .write_file(&record.path, Bytes::from(data), WriteOptions { overwrite: true })
        .await?;

    for (from, to) in moves {
        ctx.info(&format!("disk reference moved from {} to {}", from, to), &record.path);
    }
    ctx.note_metadata_update();
    Ok(())
}

/// Usage classification handed to the merge and size stages.
#[derive(Debug, Default, Clone)]
pub struct MetadataUsage {
    /// Valid records by path.
    pub records: BTreeMap<String, MetadataRecord>,
    pub unused_disks: BTreeSet<String>,
    pub unused_archives: BTreeSet<String>,
    pub unused_checksums: BTreeSet<String>,
    /// Disk -> record referencing it.
    pub disk_owners: BTreeMap<String, String>,
    /// Some record or disk could not be read; usage is a lower bound only.
    pub incomplete: bool,
}

enum RecordCheck {
    Valid(MetadataRecord),
    Dropped,
    Unknown,
}

pub(crate) async fn cross_reference(
    ctx: &CleanContext,
    vm_dir: &str,
    graph: &DiskGraph,
    files: &BackupFiles,
) -> MetadataUsage {
    let (checks, _) = tokio::join!(
        join_all(
            files
                .metadata
                .iter()
                .map(|path| check_record(ctx, path, graph, files))
        ),
        join_all(files.archives.iter().map(|path| check_archive(ctx, path))),
    );

    let mut usage = MetadataUsage {
        incomplete: graph.is_partial(),
        ..Default::default()
    };
    let mut used_disks = BTreeSet::new();
    let mut used_archives = BTreeSet::new();

    for check in checks {
        match check {
            RecordCheck::Valid(record) => {
                if let Some(archive) = &record.archive {
                    used_archives.insert(archive.clone());
                }
                for disk in &record.disks {
                    used_disks.insert(disk.clone());
                    usage.disk_owners.insert(disk.clone(), record.path.clone());
                }
                usage.records.insert(record.path.clone(), record);
            }
            RecordCheck::Dropped => {}
            RecordCheck::Unknown => usage.incomplete = true,
        }
    }

    usage.unused_disks = graph
        .paths()
        .filter(|path| !used_disks.contains(*path))
        .cloned()
        .collect();
    usage.unused_archives = files.archives.difference(&used_archives).cloned().collect();
    usage.unused_checksums = files
        .checksums
        .iter()
        .filter(|checksum| {
            paths::checksum_archive(checksum)
                .map_or(true, |archive| !used_archives.contains(archive))
        })
        .cloned()
        .collect();

    debug!(
        vm_dir = %vm_dir,
        records = usage.records.len(),
        unused_disks = usage.unused_disks.len(),
        unused_archives = usage.unused_archives.len(),
        incomplete = usage.incomplete,
        "Cross-referenced backup metadata"
    );

    usage
}

async fn check_record(
    ctx: &CleanContext,
    path: &str,
    graph: &DiskGraph,
    files: &BackupFiles,
) -> RecordCheck {
    let record = match load_record(ctx.backend.as_ref(), path).await {
        Ok(record) => record,
        Err(e) if e.is_not_found() => return RecordCheck::Dropped,
        Err(e) if e.is_structural() => {
            ctx.warn(&format!("failed to parse backup metadata: {}", e), path);
            ctx.remove_file(path, "backup metadata").await;
            return RecordCheck::Dropped;
        }
        Err(e) => {
            ctx.warn(&format!("failed to read backup metadata: {}", e), path);
            return RecordCheck::Unknown;
        }
    };

    if let Some(archive) = &record.archive {
        if !files.archives.contains(archive) {
            ctx.warn(&format!("backup archive is missing ({})", archive), path);
            ctx.remove_file(path, "incomplete backup metadata").await;
            return RecordCheck::Dropped;
        }
    }

    // One missing disk drops the whole record.
    let missing: Vec<&str> = record
        .disks
        .iter()
        .filter(|disk| !graph.contains(disk) && !graph.is_unreadable(disk))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        ctx.warn(&format!("some disks are missing ({})", missing.join(", ")), path);
        ctx.remove_file(path, "incomplete backup metadata").await;
        return RecordCheck::Dropped;
    }

    RecordCheck::Valid(record)
}

pub(crate) async fn load_record(backend: &dyn Backend, path: &str) -> Result<MetadataRecord> {
    let data = backend.read_file(path).await?;
    MetadataRecord::parse(path, &data)
}

async fn check_archive(ctx: &CleanContext, path: &str) {
    match probe_archive(ctx.backend.as_ref(), path).await {
        Ok(true) => {}
        Ok(false) => ctx.warn("backup archive may be broken", path),
        Err(e) => ctx.warn(&format!("failed to check backup archive: {}", e), path),
    }
}

/// Cheap validity check: compressed archives must carry a known magic
/// number, plain tar archives must be block aligned and end with zeroes.
pub async fn probe_archive(backend: &dyn Backend, path: &str) -> Result<bool> {
    let size = backend.get_size(path).await?;
    let head = backend.read_at(path, 0, ZSTD_MAGIC.len()).await?;

    if head.starts_with(GZIP_MAGIC) || head.starts_with(ZSTD_MAGIC) {
        return Ok(size > MIN_COMPRESSED_SIZE);
    }
    if size < TAR_END_SIZE || size % TAR_BLOCK_SIZE != 0 {
        return Ok(false);
    }

    let tail = backend
        .read_at(path, size - TAR_END_SIZE, TAR_END_SIZE as usize)
        .await?;
    Ok(tail.iter().all(|byte| *byte == 0))
}
