//! Error types for devaudit

use std::path::PathBuf;
use thiserror::Error;

/// Result type for devaudit operations
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors raised by the device store, resolver, classifier and scanner
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("device store not found: {}", path.display())]
    StoreNotFound { path: PathBuf },

    #[error("device store {} is corrupt: {reason}", path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("SQLx error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("baseline unresolved: {0}")]
    BaselineUnresolved(String),

    #[error("malformed scan data for {path}: {reason}")]
    ScanDataMalformed { path: String, reason: String },

    #[error("scanner error: {0}")]
    Scanner(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AuditError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        AuditError::StoreCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        AuditError::ScanDataMalformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for the failures that only concern a single device node
    pub fn is_per_device(&self) -> bool {
        matches!(self, AuditError::ScanDataMalformed { .. })
    }
}
