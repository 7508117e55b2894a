//! Utility modules for the backup cleaner.

pub mod errors;
pub mod logger;

pub use errors::{CleanerError, Result};
