//! Storage error handling
//!
//! Provides typed errors for durable storage operations with descriptive
//! messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The write would push the store past its byte quota
    #[error(
        "Storage quota exceeded writing '{key}': {needed} bytes needed, {available} available"
    )]
    QuotaExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    /// Disk is full
    #[error("Disk full while writing to '{path}'. Free up disk space and try again.")]
    DiskFull { path: PathBuf },

    /// A stored value could not be decoded
    #[error("Corrupt value under key '{key}': {details}")]
    CorruptValue { key: String, details: String },

    /// Value could not be encoded for storage
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull { path },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// True when the failure is about running out of room
    ///
    /// The cache degrade ladder retries smaller writes only for these.
    pub fn is_capacity(&self) -> bool {
        match self {
            StorageError::QuotaExceeded { .. } | StorageError::DiskFull { .. } => true,
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        self.is_capacity()
            || matches!(
                self,
                StorageError::PermissionDenied { .. } | StorageError::CorruptValue { .. }
            )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::QuotaExceeded { .. } => {
                Some("Raise storage_quota_bytes; cached pages were already evicted to make room.")
            }
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions for the data directory.")
            }
            StorageError::CorruptValue { .. } => {
                Some("The damaged entry is ignored; it will be rewritten on the next successful write.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
        assert!(err.is_capacity());
    }

    #[test]
    fn test_quota_exceeded_is_capacity() {
        let err = StorageError::QuotaExceeded {
            key: "cache_page_1_abc".to_string(),
            needed: 2048,
            available: 100,
        };

        assert!(err.is_capacity());
        assert!(err.is_recoverable());
        let msg = err.to_string();
        assert!(msg.contains("cache_page_1_abc"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_corrupt_value_is_not_capacity() {
        let err = StorageError::CorruptValue {
            key: "pendingOperations".to_string(),
            details: "expected array".to_string(),
        };

        assert!(!err.is_capacity());
        assert!(err.to_string().contains("pendingOperations"));
    }
}
