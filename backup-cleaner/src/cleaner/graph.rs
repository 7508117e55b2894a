//! Dependency graph builder and identity deduplication.
//!
//! Every candidate disk is opened once to read its identity and parent
//! link; handles are released right away and only [`DiskRecord`]s are kept.
//! Nodes are addressed by path, edges are stored in both directions.

use super::metadata::{retarget_disks, DiskReferences};
use super::CleanContext;
use crate::disk::{DiskRecord, OpenOptions};
use crate::Result;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct DiskGraph {
    /// Active disks by path.
    disks: BTreeMap<String, DiskRecord>,
    /// child -> parent, for every active differencing disk.
    parents: BTreeMap<String, String>,
    /// parent -> children; the parent itself may be missing.
    children: BTreeMap<String, BTreeSet<String>>,
    /// Disks that exist but could not be read this run.
    unreadable: BTreeSet<String>,
}

impl DiskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: DiskRecord) {
        if let Some(parent) = &record.parent {
            self.parents.insert(record.path.clone(), parent.clone());
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(record.path.clone());
        }
        self.disks.insert(record.path.clone(), record);
    }

    /// Drop a disk from the active set. Edges from its children stay, so
    /// they now point at a missing parent.
    pub fn remove(&mut self, path: &str) -> Option<DiskRecord> {
        let record = self.disks.remove(path)?;
        if let Some(parent) = self.parents.remove(path) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(path);
                if siblings.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
        Some(record)
    }

    /// Record a disk that exists but could not be opened for a transient
    /// reason.
    pub fn mark_unreadable(&mut self, path: &str) {
        self.unreadable.insert(path.to_string());
    }

    pub fn is_unreadable(&self, path: &str) -> bool {
        self.unreadable.contains(path)
    }

    /// Whether some disks could not be read, making the graph partial.
    pub fn is_partial(&self) -> bool {
        !self.unreadable.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.disks.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&DiskRecord> {
        self.disks.get(path)
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.disks.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &DiskRecord> {
        self.disks.values()
    }

    /// child -> parent edges of active disks.
    pub fn parent_edges(&self) -> &BTreeMap<String, String> {
        &self.parents
    }

    pub fn parent_of(&self, path: &str) -> Option<&str> {
        self.parents.get(path).map(String::as_str)
    }

    pub fn active_children(&self, parent: &str) -> Vec<&str> {
        self.children
            .get(parent)
            .map(|kids| {
                kids.iter()
                    .filter(|kid| self.disks.contains_key(*kid))
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The only active child of `parent`; `None` for leaves and forks.
    pub fn child_of(&self, parent: &str) -> Option<&str> {
        match self.active_children(parent).as_slice() {
            [child] => Some(child),
            _ => None,
        }
    }

    /// Active parents with more than one active child.
    pub fn forks(&self) -> Vec<(&str, Vec<&str>)> {
        self.children
            .keys()
            .filter(|parent| self.disks.contains_key(*parent))
            .map(|parent| (parent.as_str(), self.active_children(parent)))
            .filter(|(_, kids)| kids.len() > 1)
            .collect()
    }

    /// Forked parents and their children: never merged or deleted as unused.
    pub fn pinned(&self) -> HashSet<String> {
        let mut pinned = HashSet::new();
        for (parent, kids) in self.forks() {
            pinned.insert(parent.to_string());
            pinned.extend(kids.into_iter().map(str::to_string));
        }
        pinned
    }
}

/// Open every candidate and build the graph, then resolve duplicate
/// identities. `interrupted` maps disks with a pending merge to their
/// marker; those skip the secondary footer check.
pub(crate) async fn build_graph(
    ctx: &CleanContext,
    candidates: &BTreeSet<String>,
    interrupted: &BTreeMap<String, String>,
    references: &DiskReferences,
) -> DiskGraph {
    let opened = join_all(candidates.iter().map(|path| {
        let options = OpenOptions {
            check_secondary_footer: !interrupted.contains_key(path),
        };
        open_disk(ctx, path, options)
    }))
    .await;

    let mut graph = DiskGraph::new();
    for (path, outcome) in candidates.iter().zip(opened) {
        match outcome {
            DiskOpen::Record(record) => graph.insert(record),
            DiskOpen::Unreadable => graph.mark_unreadable(path),
            DiskOpen::Broken => {}
        }
    }

    for (parent, kids) in graph.forks() {
        ctx.error(
            &format!(
                "disk has multiple children ({}); forked chains are left untouched",
                kids.join(", ")
            ),
            parent,
        );
    }

    remove_duplicates(ctx, &mut graph, references).await;
    graph
}

enum DiskOpen {
    Record(DiskRecord),
    /// Structurally broken: out of the active set, deleted under repair.
    Broken,
    /// Transient failure: out of the active set, file left alone.
    Unreadable,
}

async fn open_disk(ctx: &CleanContext, path: &str, options: OpenOptions) -> DiskOpen {
    match ctx.codec.open(&ctx.backend, path, options).await {
        Ok(handle) => DiskOpen::Record(DiskRecord::from_handle(handle.as_ref())),
        Err(e) if e.is_structural() => {
            ctx.warn(&format!("disk check error: {}", e), path);
            ctx.remove_disk(path, "broken disk").await;
            DiskOpen::Broken
        }
        Err(e) => {
            ctx.warn(&format!("disk check error, leaving it in place: {}", e), path);
            DiskOpen::Unreadable
        }
    }
}

/// Which side of a duplicate pair holds all the data of the other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Containment {
    Kept,
    Candidate,
    Neither,
}

async fn remove_duplicates(ctx: &CleanContext, graph: &mut DiskGraph, references: &DiskReferences) {
    let mut by_id: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
    for record in graph.records() {
        by_id.entry(record.id).or_default().push(record.path.clone());
    }

    let groups: Vec<(Uuid, Vec<String>)> = by_id
        .into_iter()
        .map(|(id, paths)| (id, unrelated_members(graph, &paths)))
        .filter(|(_, paths)| paths.len() > 1)
        .collect();
    if groups.is_empty() {
        return;
    }

    let redundant = join_all(
        groups
            .iter()
            .map(|(id, paths)| find_redundant_duplicates(ctx, *id, paths)),
    )
    .await;

    // record path -> (duplicate -> kept copy)
    let mut moves: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut removable = Vec::new();
    for (path, kept) in redundant.into_iter().flatten() {
        if !graph.active_children(&path).is_empty() {
            ctx.warn(
                "duplicate disk is the parent of another disk, keeping it",
                &path,
            );
            continue;
        }
        if references.incomplete {
            ctx.warn(
                "duplicate disk kept, some backup records could not be read",
                &path,
            );
            continue;
        }

        let holders: Vec<&str> = references
            .holders(&path)
            .map(|record| record.path.as_str())
            .collect();
        if !holders.is_empty() {
            if !ctx.repair() {
                ctx.warn(
                    &format!(
                        "duplicate disk is referenced by {}, keeping it",
                        holders.join(", ")
                    ),
                    &path,
                );
                continue;
            }
            for holder in holders {
                moves
                    .entry(holder.to_string())
                    .or_default()
                    .insert(path.clone(), kept.clone());
            }
        }
        removable.push(path);
    }

    let retargets = moves.iter().map(|(record_path, record_moves)| async move {
        let Some(record) = references.get(record_path) else {
            return Vec::<String>::new();
        };
        match retarget_disks(ctx, record, record_moves).await {
            Ok(()) => Vec::new(),
            Err(e) => {
                ctx.warn(&format!("failed to update disk references: {}", e), record_path);
                record_moves.keys().cloned().collect()
            }
        }
    });
    let still_referenced: HashSet<String> =
        join_all(retargets).await.into_iter().flatten().collect();

    let mut removed = Vec::new();
    for path in removable {
        if still_referenced.contains(&path) {
            ctx.warn("duplicate disk is still referenced, keeping it", &path);
            continue;
        }
        graph.remove(&path);
        removed.push(path);
    }

    join_all(
        removed
            .iter()
            .map(|path| ctx.remove_disk(path, "duplicate disk")),
    )
    .await;
}

/// Drop group members linked as parent and child. An interrupted merge
/// hands the child's identity to the ancestor before the rename; the merge
/// stage finishes those.
fn unrelated_members(graph: &DiskGraph, paths: &[String]) -> Vec<String> {
    let mut linked = BTreeSet::new();
    for path in paths {
        if let Some(parent) = graph.parent_of(path) {
            if paths.iter().any(|other| other == parent) {
                linked.insert(path.as_str());
                linked.insert(parent);
            }
        }
    }
    paths
        .iter()
        .filter(|path| !linked.contains(path.as_str()))
        .cloned()
        .collect()
}

/// Walk a group of disks sharing `id` and return those whose data is fully
/// contained in another member, each with the member that survives. Age
/// plays no part.
async fn find_redundant_duplicates(
    ctx: &CleanContext,
    id: Uuid,
    paths: &[String],
) -> Vec<(String, String)> {
    let mut redundant = Vec::new();
    let Some((first, rest)) = paths.split_first() else {
        return Vec::new();
    };

    ctx.warn(
        &format!("disk identity {} is shared by {}", id, paths.join(", ")),
        first,
    );

    let mut kept = first.as_str();
    for candidate in rest {
        match compare(ctx, kept, candidate).await {
            Ok(Containment::Kept) => {
                ctx.warn(&format!("data fully contained in {}", kept), candidate);
                redundant.push(candidate.clone());
            }
            Ok(Containment::Candidate) => {
                ctx.warn(&format!("data fully contained in {}", candidate), kept);
                redundant.push(kept.to_string());
                kept = candidate;
            }
            Ok(Containment::Neither) => {
                ctx.warn(
                    &format!("same identity as {} but different content", kept),
                    candidate,
                );
            }
            Err(e) => {
                ctx.warn(&format!("failed to compare with {}: {}", kept, e), candidate);
            }
        }
    }

    redundant
        .into_iter()
        .map(|path| (path, kept.to_string()))
        .collect()
}

async fn compare(ctx: &CleanContext, kept: &str, candidate: &str) -> Result<Containment> {
    // Both disks were validated already; a pending merge must not fail here.
    let options = OpenOptions {
        check_secondary_footer: false,
    };
    let kept_disk = ctx.codec.open(&ctx.backend, kept, options).await?;
    let candidate_disk = ctx.codec.open(&ctx.backend, candidate, options).await?;

    if kept_disk.contains_all_data_of(candidate_disk.as_ref()).await? {
        Ok(Containment::Kept)
    } else if candidate_disk.contains_all_data_of(kept_disk.as_ref()).await? {
        Ok(Containment::Candidate)
    } else {
        Ok(Containment::Neither)
    }
}
