//! Size reconciliation: keep the `size` stored in each backup record in
//! line with the files it references.

use super::metadata::{MetadataRecord, MetadataUsage};
use super::CleanContext;
use crate::disk::OpenOptions;
use crate::storage::WriteOptions;
use crate::Result;
use bytes::Bytes;
use futures_util::future::{join_all, try_join_all};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Recompute the size of every surviving record. Records touched by a merge
/// this run are always rewritten; other mismatches are reported and only
/// fixed when `fix_metadata_sizes` is set.
pub(crate) async fn reconcile_sizes(
    ctx: &CleanContext,
    vm_dir: &str,
    usage: &MetadataUsage,
    merged_targets: &[String],
) {
    let merged_records: HashSet<&str> = merged_targets
        .iter()
        .filter_map(|target| usage.disk_owners.get(target))
        .map(String::as_str)
        .collect();

    join_all(usage.records.values().map(|record| {
        reconcile_record(ctx, record, merged_records.contains(record.path.as_str()))
    }))
    .await;

    debug!(
        vm_dir = %vm_dir,
        records = usage.records.len(),
        merged = merged_records.len(),
        "Reconciled backup sizes"
    );
}

async fn reconcile_record(ctx: &CleanContext, record: &MetadataRecord, merged: bool) {
    let actual = match backup_size(ctx, record).await {
        Ok(Some(size)) => size,
        Ok(None) => {
            debug!(path = %record.path, "Backup size not cheaply computable, skipping");
            return;
        }
        Err(e) => {
            ctx.warn(&format!("failed to compute backup size: {}", e), &record.path);
            return;
        }
    };

    if !merged {
        let stored = record.metadata.size;
        if stored == Some(actual) {
            return;
        }
        ctx.warn(
            &format!(
                "incorrect backup size in metadata: {} instead of {}",
                stored.map_or_else(|| "none".to_string(), |size| size.to_string()),
                actual
            ),
            &record.path,
        );
        if !ctx.options.fix_metadata_sizes {
            return;
        }
    }

    if !ctx.repair() {
        return;
    }
    if let Err(e) = write_size(ctx, record, actual).await {
        ctx.warn(&format!("failed to update backup size: {}", e), &record.path);
    }
}

/// Archive size for full backups, sum of disk sizes for delta backups.
/// `None` when a disk cannot tell its size without reading every block.
async fn backup_size(ctx: &CleanContext, record: &MetadataRecord) -> Result<Option<u64>> {
    if let Some(archive) = &record.archive {
        return Ok(Some(ctx.backend.get_size(archive).await?));
    }

    let sizes = try_join_all(record.disks.iter().map(|disk| async move {
        let handle = ctx
            .codec
            .open(&ctx.backend, disk, OpenOptions::default())
            .await?;
        Ok::<_, crate::CleanerError>(handle.on_disk_size())
    }))
    .await?;

    Ok(sizes.into_iter().sum())
}

async fn write_size(ctx: &CleanContext, record: &MetadataRecord, size: u64) -> Result<()> {
    let mut document = record.document.clone();
    document["size"] = Value::from(size);

    let data = serde_json::to_vec(&document)?;
    ctx.backend
        .write_file(&record.path, Bytes::from(data), WriteOptions { overwrite: true })
        .await?;

    ctx.info(&format!("backup size set to {}", size), &record.path);
    ctx.note_metadata_update();
    Ok(())
}
