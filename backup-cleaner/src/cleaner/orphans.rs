//! Orphan pruner: a disk whose ancestry leads to a missing parent can never
//! be read back and is removed.

use super::graph::DiskGraph;
use super::CleanContext;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct OrphanScan {
    /// Orphaned disk -> first missing ancestor on its chain.
    pub orphans: BTreeMap<String, String>,
    /// Disks whose parent links loop back on themselves.
    pub cycles: Vec<String>,
}

#[derive(Debug, Clone)]
enum Ancestry {
    Rooted,
    Missing(String),
    Cycle,
}

/// Classify every active disk. Walks are iterative and memoized, so long
/// chains cost one pass. A disk whose parent exists but could not be read
/// is treated as rooted.
pub fn find_orphans(graph: &DiskGraph) -> OrphanScan {
    let mut known: HashMap<&str, Ancestry> = HashMap::new();

    for start in graph.paths() {
        if known.contains_key(start.as_str()) {
            continue;
        }

        let mut walk: Vec<&str> = Vec::new();
        let mut on_walk: HashSet<&str> = HashSet::new();
        let mut current = start.as_str();
        let verdict = loop {
            if let Some(found) = known.get(current) {
                break found.clone();
            }
            if !on_walk.insert(current) {
                break Ancestry::Cycle;
            }
            walk.push(current);

            match graph.parent_of(current) {
                None => break Ancestry::Rooted,
                Some(parent) if graph.contains(parent) => current = parent,
                Some(parent) if graph.is_unreadable(parent) => break Ancestry::Rooted,
                Some(parent) => break Ancestry::Missing(parent.to_string()),
            }
        };

        for path in walk {
            known.insert(path, verdict.clone());
        }
    }

    let mut scan = OrphanScan::default();
    for (path, ancestry) in known {
        match ancestry {
            Ancestry::Rooted => {}
            Ancestry::Missing(parent) => {
                scan.orphans.insert(path.to_string(), parent);
            }
            Ancestry::Cycle => scan.cycles.push(path.to_string()),
        }
    }
    scan.cycles.sort();
    scan
}

/// Drop orphans from the graph and delete them under repair.
pub(crate) async fn prune_orphans(ctx: &CleanContext, graph: &mut DiskGraph) {
    let scan = find_orphans(graph);

    for path in &scan.cycles {
        ctx.error("disk chain loops back on itself, leaving it untouched", path);
    }

    for (path, missing) in &scan.orphans {
        ctx.warn(&format!("parent disk is missing ({})", missing), path);
        graph.remove(path);
    }

    join_all(
        scan.orphans
            .keys()
            .map(|path| ctx.remove_disk(path, "orphan disk")),
    )
    .await;
}
