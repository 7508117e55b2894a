//! Backup Cleaner Library
//!
//! Consistency checker and chain-merge engine for VHD backup repositories.
//! One call to [`clean_repository`] scans a VM backup directory, removes
//! garbage left behind by crashes and partial merges, and folds obsolete
//! incremental chains into the disks that are still referenced.

pub mod cleaner;
pub mod config;
pub mod disk;
pub mod paths;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use cleaner::events::{CleanEvent, EventBus, LogLevel};
pub use cleaner::scheduler::MergeScheduler;
pub use cleaner::{clean_repository, CleanOptions, CleanReport, RepositoryCleaner};
pub use config::CleanerConfig;
pub use utils::errors::CleanerError;
pub type Result<T> = std::result::Result<T, CleanerError>;
