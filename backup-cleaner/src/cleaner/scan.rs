//! Repository scanner: enumerate the disk tree of a VM backup directory.
//!
//! Layout: `<vm>/vdis/<job>/<logical disk>/` holds disks, aliases and merge
//! markers. Missing levels are treated as empty.

use super::CleanContext;
use crate::paths;
use crate::storage::ListOptions;
use crate::Result;
use futures_util::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Everything found below `<vm>/vdis`.
#[derive(Debug, Default)]
pub struct RepositoryScan {
    /// Disk and alias files.
    pub disks: BTreeSet<String>,

    /// Logical-disk directory -> alias files it contains (possibly none).
    pub aliases: BTreeMap<String, Vec<String>>,

    /// Expected disk path -> marker of its interrupted merge.
    pub interrupted: BTreeMap<String, String>,
}

/// What one logical-disk directory contributes to the scan.
#[derive(Debug, Default)]
struct DiskDirScan {
    dir: String,
    disks: Vec<String>,
    aliases: Vec<String>,
    markers: Vec<(String, String)>,
}

pub(crate) async fn scan_repository(ctx: &CleanContext, vm_dir: &str) -> Result<RepositoryScan> {
    let vdis_dir = paths::join(vm_dir, paths::VDIS_DIR);
    let job_dirs = ctx.backend.list(&vdis_dir, ListOptions::tolerant()).await?;

    let per_job = try_join_all(job_dirs.iter().map(|job_dir| scan_job(ctx, job_dir))).await?;

    let mut scan = RepositoryScan::default();
    for dir_scan in per_job.into_iter().flatten() {
        scan.disks.extend(dir_scan.disks);
        scan.interrupted.extend(dir_scan.markers);
        scan.aliases.insert(dir_scan.dir, dir_scan.aliases);
    }

    debug!(
        vm_dir = %vm_dir,
        disks = scan.disks.len(),
        disk_dirs = scan.aliases.len(),
        interrupted = scan.interrupted.len(),
        "Scanned disk tree"
    );

    Ok(scan)
}

async fn scan_job(ctx: &CleanContext, job_dir: &str) -> Result<Vec<DiskDirScan>> {
    let disk_dirs = ctx.backend.list(job_dir, ListOptions::tolerant()).await?;
    try_join_all(disk_dirs.iter().map(|dir| scan_disk_dir(ctx, dir))).await
}

async fn scan_disk_dir(ctx: &CleanContext, dir: &str) -> Result<DiskDirScan> {
    let names = ctx
        .backend
        .list(
            dir,
            ListOptions {
                ignore_missing: true,
                prepend_dir: false,
            },
        )
        .await?;

    let mut scan = DiskDirScan {
        dir: dir.to_string(),
        ..Default::default()
    };

    for name in names {
        let path = paths::join(dir, &name);
        if let Some(target) = paths::marker_target(&name) {
            scan.markers.push((paths::join(dir, target), path));
        } else if paths::is_disk_file(&name) {
            if paths::is_alias_file(&name) {
                scan.aliases.push(path.clone());
            }
            scan.disks.push(path);
        }
    }

    Ok(scan)
}
