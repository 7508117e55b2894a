//! Chain merge planning and execution.
//!
//! Unused disks are grouped into chains `[ancestor, c1, .., cn]` where every
//! member but `cn` is unused. The chain is folded into the ancestor, which
//! then takes over `cn`'s path. Unused chains that end without a used child
//! are plain garbage and deleted.
//!
//! Each merge is bracketed by a marker file next to the ancestor, so a crash
//! at any point is picked up by the next run:
//! 1. write `.<ancestor>.merge.json`
//! 2. merge the children into the ancestor
//! 3. rename the ancestor over the final child
//! 4. delete the intermediate children
//! 5. delete the marker

use super::events::{percent, CleanEvent};
use super::graph::DiskGraph;
use super::metadata::MetadataUsage;
use super::CleanContext;
use crate::disk::{rename_disk, MergeMarker, MergeOptions, MergeProgress};
use crate::paths;
use crate::storage::unlink_if_exists;
use crate::Result;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Floor for the progress ticker; `interval` rejects a zero period.
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeChain {
    pub ancestor: String,
    /// Oldest first; never empty.
    pub children: Vec<String>,
    /// Resumes an interrupted merge.
    pub forced: bool,
}

impl MergeChain {
    /// The disk whose path survives the merge.
    pub fn target(&self) -> &str {
        self.children.last().unwrap_or(&self.ancestor)
    }

    pub fn members(&self) -> Vec<String> {
        std::iter::once(self.ancestor.clone())
            .chain(self.children.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The chain runs into a forked disk.
    Forked,
    /// A member belongs to an interrupted merge being resumed.
    Overlap,
    /// Parent links loop back.
    Cycle,
    /// A marked ancestor is still referenced by a backup.
    StillReferenced,
    /// A marked ancestor has no single child to merge into.
    NoSingleChild,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::Forked => "chain leads into a forked disk",
            SkipReason::Overlap => "chain overlaps an interrupted merge",
            SkipReason::Cycle => "chain loops back on itself",
            SkipReason::StillReferenced => "interrupted merge ancestor is still referenced by a backup",
            SkipReason::NoSingleChild => "interrupted merge ancestor has no single child",
        };
        f.write_str(reason)
    }
}

/// Disks left alone this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChain {
    pub members: Vec<String>,
    pub reason: SkipReason,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Interrupted merges first, then chains found from usage.
    pub chains: Vec<MergeChain>,
    /// Unused chains ending in a leaf, deleted outright.
    pub garbage: Vec<Vec<String>>,
    pub skipped: Vec<SkippedChain>,
}

#[derive(Debug, Default, Clone)]
pub struct MergeOutcome {
    /// Final paths of the chains merged this run.
    pub merged_targets: Vec<String>,
}

/// Check every marker found by the scan. Markers whose disk is gone, or
/// whose disk has no child left, belong to a merge that already renamed
/// its result and are removed. Returns the markers still to be resumed.
pub(crate) async fn settle_markers(
    ctx: &CleanContext,
    graph: &DiskGraph,
    interrupted: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut pending = BTreeMap::new();
    let mut stale = Vec::new();

    for (disk, marker) in interrupted {
        if graph.is_unreadable(disk) {
            continue;
        }
        if !graph.contains(disk) {
            ctx.warn("merge marker references a missing disk", marker);
            stale.push(marker);
        } else if graph.active_children(disk).is_empty() {
            // A hidden child would look like a leaf here.
            if graph.is_partial() {
                continue;
            }
            ctx.warn("merge marker on a disk without child", marker);
            stale.push(marker);
        } else {
            pending.insert(disk.clone(), marker.clone());
        }
    }

    join_all(
        stale
            .into_iter()
            .map(|marker| ctx.remove_file(marker, "stale merge marker")),
    )
    .await;

    pending
}

/// Compute merge chains and garbage from the usage classification.
/// `markers` maps ancestors of interrupted merges to their marker.
pub fn plan_merges(
    graph: &DiskGraph,
    unused: &BTreeSet<String>,
    markers: &BTreeMap<String, String>,
) -> MergePlan {
    let pinned = graph.pinned();
    let mut plan = MergePlan::default();
    let mut claimed: HashSet<&str> = HashSet::new();

    for ancestor in markers.keys() {
        if !graph.contains(ancestor) {
            continue;
        }
        let skip = |reason| SkippedChain {
            members: vec![ancestor.clone()],
            reason,
        };

        let Some(child) = graph.child_of(ancestor) else {
            plan.skipped.push(skip(SkipReason::NoSingleChild));
            continue;
        };
        if !unused.contains(ancestor) {
            plan.skipped.push(skip(SkipReason::StillReferenced));
            continue;
        }
        if pinned.contains(ancestor) || pinned.contains(child) {
            plan.skipped.push(skip(SkipReason::Forked));
            continue;
        }
        if claimed.contains(ancestor.as_str()) || claimed.contains(child) {
            plan.skipped.push(skip(SkipReason::Overlap));
            continue;
        }

        claimed.insert(ancestor);
        claimed.insert(child);
        plan.chains.push(MergeChain {
            ancestor: ancestor.clone(),
            children: vec![child.to_string()],
            forced: true,
        });
    }

    let mut visited: HashSet<&str> = HashSet::new();
    for disk in unused {
        if visited.contains(disk.as_str())
            || claimed.contains(disk.as_str())
            || pinned.contains(disk)
            || !graph.contains(disk)
        {
            continue;
        }

        let start = chain_start(graph, unused, &pinned, disk);
        let mut members: Vec<&str> = vec![start];
        let mut current = start;
        let end = loop {
            let Some(child) = graph.child_of(current) else {
                break ChainEnd::Leaf;
            };
            if members.contains(&child) {
                break ChainEnd::Cycle;
            }
            if pinned.contains(child) {
                break ChainEnd::Forked;
            }
            if !unused.contains(child) {
                break ChainEnd::Used(child);
            }
            members.push(child);
            current = child;
        };
        visited.extend(members.iter().copied());

        let owned = |members: &[&str]| members.iter().map(|m| m.to_string()).collect::<Vec<_>>();
        let skip = |reason| SkippedChain {
            members: owned(&members),
            reason,
        };

        match end {
            ChainEnd::Cycle => plan.skipped.push(skip(SkipReason::Cycle)),
            ChainEnd::Forked => plan.skipped.push(skip(SkipReason::Forked)),
            _ if members.iter().any(|m| claimed.contains(m)) => {
                plan.skipped.push(skip(SkipReason::Overlap))
            }
            ChainEnd::Used(child) if claimed.contains(child) => {
                plan.skipped.push(skip(SkipReason::Overlap))
            }
            ChainEnd::Leaf => plan.garbage.push(owned(&members)),
            ChainEnd::Used(child) => {
                let mut children = owned(&members[1..]);
                children.push(child.to_string());
                plan.chains.push(MergeChain {
                    ancestor: start.to_string(),
                    children,
                    forced: false,
                });
            }
        }
    }

    plan
}

enum ChainEnd<'a> {
    Leaf,
    Used(&'a str),
    Forked,
    Cycle,
}

/// Oldest unused disk that leads to `disk` through single-child links.
fn chain_start<'a>(
    graph: &'a DiskGraph,
    unused: &BTreeSet<String>,
    pinned: &HashSet<String>,
    disk: &'a str,
) -> &'a str {
    let mut seen: HashSet<&str> = HashSet::from([disk]);
    let mut current = disk;
    while let Some(parent) = graph.parent_of(current) {
        let extends = graph.contains(parent)
            && unused.contains(parent)
            && !pinned.contains(parent)
            && graph.child_of(parent) == Some(current);
        if !extends || !seen.insert(parent) {
            break;
        }
        current = parent;
    }
    current
}

/// Delete garbage and unused archives, and run the planned merges. All of
/// it proceeds concurrently; merges are throttled by the scheduler.
pub(crate) async fn execute(
    ctx: &CleanContext,
    vm_dir: &str,
    plan: &MergePlan,
    usage: &MetadataUsage,
    markers: &BTreeMap<String, String>,
) -> MergeOutcome {
    for skipped in &plan.skipped {
        if let Some(first) = skipped.members.first() {
            ctx.warn(
                &format!("{}, leaving {} for a later run", skipped.reason, skipped.members.join(", ")),
                first,
            );
        }
    }

    if usage.incomplete {
        ctx.warn(
            "some backups or disks could not be read, skipping merges and unused file removal",
            vm_dir,
        );
        return MergeOutcome::default();
    }

    let garbage = join_all(plan.garbage.iter().flatten().map(|disk| async move {
        ctx.warn("disk is not referenced by any backup", disk);
        ctx.remove_disk(disk, "unused disk").await;
    }));
    let archives = join_all(usage.unused_archives.iter().map(|archive| async move {
        ctx.warn("backup archive is not referenced by any backup", archive);
        ctx.remove_file(archive, "unused backup archive").await;
    }));
    let checksums = join_all(usage.unused_checksums.iter().map(|checksum| async move {
        ctx.warn("checksum of a missing or unused archive", checksum);
        ctx.remove_file(checksum, "archive checksum").await;
    }));
    let merges = join_all(plan.chains.iter().map(|chain| run_chain(ctx, chain, markers)));

    let (_, _, _, merged) = tokio::join!(garbage, archives, checksums, merges);

    MergeOutcome {
        merged_targets: merged.into_iter().flatten().collect(),
    }
}

/// Merge one chain when allowed, report it otherwise. Returns the merged
/// target on success.
async fn run_chain(
    ctx: &CleanContext,
    chain: &MergeChain,
    markers: &BTreeMap<String, String>,
) -> Option<String> {
    let target = chain.target().to_string();

    if !(ctx.options.merge && ctx.repair()) {
        ctx.info(
            &format!("chain should be merged into {} ({})", target, chain.members().join(", ")),
            &chain.ancestor,
        );
        return None;
    }

    let _permit = match ctx.options.scheduler.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            ctx.error(&format!("merge not started: {}", e), &chain.ancestor);
            return None;
        }
    };

    match merge_chain(ctx, chain, markers).await {
        Ok(()) => Some(target),
        Err(e) => {
            ctx.error(&format!("merge failed: {}", e), &chain.ancestor);
            ctx.emit(CleanEvent::MergeFailed {
                ancestor: chain.ancestor.clone(),
                error: e.to_string(),
            });
            None
        }
    }
}

async fn merge_chain(
    ctx: &CleanContext,
    chain: &MergeChain,
    markers: &BTreeMap<String, String>,
) -> Result<()> {
    let backend = ctx.backend.as_ref();
    let target = chain.target();
    let marker_path = paths::marker_path(&chain.ancestor);

    if let Some(existing) = markers.get(&chain.ancestor) {
        match MergeMarker::load(backend, existing).await {
            Ok(marker) => ctx.info(
                &format!(
                    "resuming merge started at {}",
                    marker.started_at.to_rfc3339()
                ),
                &chain.ancestor,
            ),
            Err(e) => debug!(marker = %existing, error = %e, "Unreadable merge marker"),
        }
    }

    MergeMarker::new(chain.members())
        .create(backend, &chain.ancestor)
        .await?;

    ctx.info(
        &format!("merging {} children into {}", chain.children.len(), target),
        &chain.ancestor,
    );
    ctx.emit(CleanEvent::MergeStarted {
        ancestor: chain.ancestor.clone(),
        children: chain.children.clone(),
    });

    let start_time = Instant::now();
    let progress = MergeProgress::new();
    let merge = ctx.codec.merge_chain(
        &ctx.backend,
        &chain.ancestor,
        &chain.children,
        MergeOptions {
            progress: progress.clone(),
        },
    );
    tokio::pin!(merge);

    let mut ticker = tokio::time::interval(ctx.options.progress_interval.max(MIN_PROGRESS_INTERVAL));
    // The first tick fires immediately.
    ticker.tick().await;

    let merged_size = loop {
        tokio::select! {
            result = &mut merge => break result?,
            _ = ticker.tick() => {
                let (done, total) = progress.snapshot();
                let percent = percent(done, total);
                info!(
                    ancestor = %chain.ancestor,
                    done,
                    total,
                    "Merge progress: {:.1}%",
                    percent
                );
                ctx.emit(CleanEvent::MergeProgress {
                    ancestor: chain.ancestor.clone(),
                    done,
                    total,
                    percent,
                });
            }
        }
    };

    // The ancestor now holds the whole chain.
    rename_disk(backend, &chain.ancestor, target).await?;

    let intermediates = &chain.children[..chain.children.len() - 1];
    let removed = join_all(
        intermediates
            .iter()
            .map(|child| ctx.remove_disk(child, "merged disk")),
    )
    .await;

    if removed.iter().all(|ok| *ok) {
        unlink_if_exists(backend, &marker_path).await?;
    } else {
        ctx.warn(
            "some merged disks could not be removed, keeping the merge marker",
            &chain.ancestor,
        );
    }

    let duration_secs = start_time.elapsed().as_secs();
    ctx.info(
        &format!("merge completed in {}s", duration_secs),
        target,
    );
    ctx.emit(CleanEvent::MergeCompleted {
        target: target.to_string(),
        merged_size,
        duration_secs,
    });

    Ok(())
}
