//! Repository cleaner - checks and repairs one VM backup directory.
//!
//! The run is a fixed pipeline; every stage fans out over its items and is
//! joined before the next one starts:
//! - scan: enumerate disks, aliases, merge markers and backup records
//! - aliases: validate alias files and their targets
//! - graph: open every disk, link parents to children, resolve duplicates
//! - orphans: drop chains whose ancestor is gone
//! - metadata: classify disks and archives as used or unused
//! - merge: fold unused chains into their used child, delete garbage
//! - sizes: reconcile the size stored in each backup record
//!
//! With `repair` disabled the run is strictly read-only.

pub mod aliases;
pub mod events;
pub mod graph;
pub mod merge;
pub mod metadata;
pub mod orphans;
pub mod scan;
pub mod scheduler;
pub mod sizes;

use crate::disk::{unlink_disk, DiskCodec};
use crate::paths;
use crate::storage::{unlink_if_exists, Backend};
use crate::Result;
use events::{CleanEvent, EventBus, LogLevel};
use scheduler::MergeScheduler;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::info;

/// Default interval between merge progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// What a clean run is allowed to do.
#[derive(Debug, Clone)]
pub struct CleanOptions {
    /// Delete broken, orphaned and unused files and write fixes. When off,
    /// no delete, write or rename call is ever issued.
    pub repair: bool,

    /// Merge unused chains into their used child (needs `repair`).
    pub merge: bool,

    /// Rewrite stored backup sizes that disagree with the files even when
    /// no merge touched the record (needs `repair`).
    pub fix_metadata_sizes: bool,

    /// Limits concurrent merges; owned by the caller.
    pub scheduler: MergeScheduler,

    /// How often a running merge reports progress.
    pub progress_interval: Duration,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            repair: false,
            merge: false,
            fix_metadata_sizes: false,
            scheduler: MergeScheduler::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Clean run result
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    /// At least one chain needed merging (merged when `merge` and `repair`
    /// were both set, reported otherwise).
    pub merge_performed: bool,
    pub merged_chains: usize,
    pub deleted_files: usize,
    pub metadata_updated: usize,
    pub warnings: usize,
    pub duration_secs: u64,
}

/// Shared state of one run, handed to every stage.
pub(crate) struct CleanContext {
    pub backend: Arc<dyn Backend>,
    pub codec: Arc<dyn DiskCodec>,
    pub options: CleanOptions,
    pub events: EventBus,
    deleted: AtomicUsize,
    warnings: AtomicUsize,
    metadata_updated: AtomicUsize,
}

impl CleanContext {
    pub fn new(
        backend: Arc<dyn Backend>,
        codec: Arc<dyn DiskCodec>,
        options: CleanOptions,
        events: EventBus,
    ) -> Self {
        Self {
            backend,
            codec,
            options,
            events,
            deleted: AtomicUsize::new(0),
            warnings: AtomicUsize::new(0),
            metadata_updated: AtomicUsize::new(0),
        }
    }

    pub fn repair(&self) -> bool {
        self.options.repair
    }

    pub fn info(&self, message: &str, path: &str) {
        self.events.log(LogLevel::Info, message, Some(path));
    }

    pub fn warn(&self, message: &str, path: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        self.events.log(LogLevel::Warn, message, Some(path));
    }

    pub fn error(&self, message: &str, path: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        self.events.log(LogLevel::Error, message, Some(path));
    }

    pub fn emit(&self, event: CleanEvent) {
        self.events.emit(event);
    }

    pub fn note_metadata_update(&self) {
        self.metadata_updated.fetch_add(1, Ordering::Relaxed);
    }

    /// Delete a plain file when repairing. `what` names it in the log.
    pub async fn remove_file(&self, path: &str, what: &str) -> bool {
        if !self.repair() {
            return false;
        }
        self.info(&format!("deleting {}", what), path);
        match unlink_if_exists(self.backend.as_ref(), path).await {
            Ok(removed) => {
                if removed {
                    self.deleted.fetch_add(1, Ordering::Relaxed);
                }
                removed
            }
            Err(e) => {
                self.warn(&format!("failed to delete {}: {}", what, e), path);
                false
            }
        }
    }

    /// Delete a disk (alias and target together) when repairing.
    pub async fn remove_disk(&self, path: &str, what: &str) -> bool {
        if !self.repair() {
            return false;
        }
        self.info(&format!("deleting {}", what), path);
        match unlink_disk(self.backend.as_ref(), path).await {
            Ok(()) => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.warn(&format!("failed to delete {}: {}", what, e), path);
                false
            }
        }
    }
}

/// Checks and repairs backup directories with a fixed backend and codec.
pub struct RepositoryCleaner {
    backend: Arc<dyn Backend>,
    codec: Arc<dyn DiskCodec>,
    options: CleanOptions,
    events: EventBus,
}

impl RepositoryCleaner {
    pub fn new(backend: Arc<dyn Backend>, codec: Arc<dyn DiskCodec>, options: CleanOptions) -> Self {
        Self {
            backend,
            codec,
            options,
            events: EventBus::new(),
        }
    }

    /// Receive findings and merge progress of subsequent runs.
    pub fn subscribe(&self) -> broadcast::Receiver<CleanEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &CleanOptions {
        &self.options
    }

    /// Run the whole pipeline on `vm_dir`.
    ///
    /// Per-file problems are logged and never abort the run. An error is
    /// returned only when the directory itself cannot be enumerated, before
    /// anything is modified: an incomplete listing would make live backups
    /// look unreferenced.
    pub async fn clean(&self, vm_dir: &str) -> Result<CleanReport> {
        let start_time = Instant::now();
        let vm_dir = paths::normalize(vm_dir);
        let ctx = CleanContext::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.codec),
            self.options.clone(),
            self.events.clone(),
        );

        info!(
            vm_dir = %vm_dir,
            repair = ctx.options.repair,
            merge = ctx.options.merge,
            "Starting repository clean"
        );

        let (repository, backups) = tokio::try_join!(
            scan::scan_repository(&ctx, &vm_dir),
            metadata::list_backup_files(&ctx, &vm_dir),
        )?;

        let invalid_aliases =
            aliases::check_aliases(&ctx, &repository.aliases, &repository.interrupted).await;
        let candidates: BTreeSet<String> = repository
            .disks
            .iter()
            .filter(|path| !invalid_aliases.contains(*path))
            .cloned()
            .collect();

        let references = metadata::load_references(&ctx, &backups).await;
        let mut graph =
            graph::build_graph(&ctx, &candidates, &repository.interrupted, &references).await;
        orphans::prune_orphans(&ctx, &mut graph).await;
        let markers = merge::settle_markers(&ctx, &graph, &repository.interrupted).await;

        let usage = metadata::cross_reference(&ctx, &vm_dir, &graph, &backups).await;

        let plan = merge::plan_merges(&graph, &usage.unused_disks, &markers);
        let outcome = merge::execute(&ctx, &vm_dir, &plan, &usage, &markers).await;

        sizes::reconcile_sizes(&ctx, &vm_dir, &usage, &outcome.merged_targets).await;

        let report = CleanReport {
            merge_performed: !plan.chains.is_empty(),
            merged_chains: outcome.merged_targets.len(),
            deleted_files: ctx.deleted.load(Ordering::Relaxed),
            metadata_updated: ctx.metadata_updated.load(Ordering::Relaxed),
            warnings: ctx.warnings.load(Ordering::Relaxed),
            duration_secs: start_time.elapsed().as_secs(),
        };

        info!(
            vm_dir = %vm_dir,
            merge_performed = report.merge_performed,
            merged_chains = report.merged_chains,
            deleted_files = report.deleted_files,
            metadata_updated = report.metadata_updated,
            warnings = report.warnings,
            "Repository clean completed"
        );

        Ok(report)
    }
}

/// One-shot entry point: clean `vm_dir` with the given collaborators.
pub async fn clean_repository(
    backend: Arc<dyn Backend>,
    codec: Arc<dyn DiskCodec>,
    vm_dir: &str,
    options: CleanOptions,
) -> Result<CleanReport> {
    RepositoryCleaner::new(backend, codec, options).clean(vm_dir).await
}
