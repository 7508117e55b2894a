//! Custom error types for the backup cleaner.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt disk {path}: {reason}")]
    CorruptDisk { path: String, reason: String },

    #[error("Invalid alias {path}: {reason}")]
    InvalidAlias { path: String, reason: String },

    #[error("Invalid backup metadata {path}: {reason}")]
    InvalidMetadata { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Merge error: {0}")]
    Merge(String),
}

impl CleanerError {
    /// True when the file simply does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            CleanerError::NotFound(_) => true,
            CleanerError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the content itself is malformed. Only these failures make
    /// a file eligible for removal; everything else may be transient.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CleanerError::CorruptDisk { .. }
                | CleanerError::InvalidAlias { .. }
                | CleanerError::InvalidMetadata { .. }
                | CleanerError::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CleanerError>;
