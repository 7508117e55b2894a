//! Configuration management for the backup cleaner.
//!
//! Loads run options and logging settings from a TOML file.

use crate::cleaner::scheduler::{MergeScheduler, DEFAULT_MERGE_CONCURRENCY};
use crate::cleaner::{CleanOptions, DEFAULT_PROGRESS_INTERVAL};
use crate::utils::errors::{CleanerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanerConfig {
    #[serde(default)]
    pub clean: CleanConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanConfig {
    /// Delete broken and unused files, write fixes
    #[serde(default)]
    pub repair: bool,

    /// Merge unused chains (only with `repair`)
    #[serde(default)]
    pub merge: bool,

    /// Fix wrong backup sizes even when no merge happened
    #[serde(default)]
    pub fix_metadata_sizes: bool,

    /// Maximum concurrent merges
    #[serde(default = "default_merge_concurrency")]
    pub merge_concurrency: usize,

    /// Seconds between merge progress events
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_merge_concurrency() -> usize {
    DEFAULT_MERGE_CONCURRENCY
}

fn default_progress_interval_secs() -> u64 {
    DEFAULT_PROGRESS_INTERVAL.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            repair: false,
            merge: false,
            fix_metadata_sizes: false,
            merge_concurrency: default_merge_concurrency(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CleanerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CleanerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clean.merge_concurrency == 0 {
            return Err(CleanerError::Config(
                "clean.merge_concurrency must be at least 1".to_string(),
            ));
        }
        if self.clean.progress_interval_secs == 0 {
            return Err(CleanerError::Config(
                "clean.progress_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Run options with a fresh scheduler. Clone the scheduler out of the
    /// result to share the merge limit between several cleaners.
    pub fn clean_options(&self) -> CleanOptions {
        CleanOptions {
            repair: self.clean.repair,
            merge: self.clean.merge,
            fix_metadata_sizes: self.clean.fix_metadata_sizes,
            scheduler: MergeScheduler::new(self.clean.merge_concurrency),
            progress_interval: Duration::from_secs(self.clean.progress_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_read_only() {
        let config = CleanerConfig::default();
        let options = config.clean_options();

        assert!(!options.repair);
        assert!(!options.merge);
        assert_eq!(options.scheduler.limit(), 1);
        assert_eq!(options.progress_interval, Duration::from_secs(10));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[clean]\nrepair = true\nmerge = true\nmerge_concurrency = 3\n\n[log]\nlevel = \"debug\""
        )
        .unwrap();

        let config = CleanerConfig::from_file(file.path()).unwrap();
        assert!(config.clean.repair);
        assert!(!config.clean.fix_metadata_sizes);
        assert_eq!(config.clean.progress_interval_secs, 10);
        assert_eq!(config.clean_options().scheduler.limit(), 3);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: CleanerConfig = toml::from_str("").unwrap();
        assert_eq!(config.clean.merge_concurrency, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config: CleanerConfig = toml::from_str("[clean]\nmerge_concurrency = 0").unwrap();
        assert!(matches!(config.validate(), Err(CleanerError::Config(_))));
    }
}
