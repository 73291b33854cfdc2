//! Error types for segstore
//!
//! This module defines the common error type used by the cache, the
//! object store and the durable logs.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for segstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for segstore
#[derive(Debug, Error)]
pub enum Error {
    // Local storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("data corruption detected: {0}")]
    Corrupted(String),

    // Cache errors
    #[error("file is not cached: {}", .path.display())]
    NotCached { path: PathBuf },

    #[error("cache entry was evicted: {}", .path.display())]
    Evicted { path: PathBuf },

    #[error("file is in use by {refs} lease(s): {}", .path.display())]
    FileBusy { path: PathBuf, refs: usize },

    #[error("lock is held by another writer: {}", .path.display())]
    LockHeld { path: PathBuf },

    // Log errors
    #[error("index not found: {index}")]
    IndexNotFound { index: String },

    #[error("redo key not found: {key}")]
    KeyNotFound { key: u64 },

    #[error("log entry not found: {index}")]
    EntryNotFound { index: u64 },

    #[error("value too large: {len} bytes, max {max} bytes")]
    ValueTooLarge { len: usize, max: usize },

    #[error("log is closed")]
    Closed,

    // Remote errors
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("failed to persist {key}: {reason}")]
    Persist { key: String, reason: String },

    #[error("read-only store: {0}")]
    ReadOnly(String),

    // Setup errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Check if retrying the same call later may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Evicted { .. } | Self::FileBusy { .. } | Self::LockHeld { .. } | Self::Backend(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotCached { .. }
                | Self::IndexNotFound { .. }
                | Self::KeyNotFound { .. }
                | Self::EntryNotFound { .. }
                | Self::ObjectNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::LockHeld { path: "a.seg".into() }.is_retryable());
        assert!(Error::backend("connection reset").is_retryable());
        assert!(!Error::ValueTooLarge { len: 65, max: 64 }.is_retryable());
        assert!(!Error::Closed.is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::KeyNotFound { key: 7 }.is_not_found());
        assert!(
            Error::IndexNotFound {
                index: "products".into()
            }
            .is_not_found()
        );
        assert!(Error::NotCached { path: "x".into() }.is_not_found());
        assert!(
            Error::ObjectNotFound {
                key: "idx/000000000001.seg".into()
            }
            .is_not_found()
        );
        assert!(!Error::storage("boom").is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::FileBusy {
            path: "/data/idx/000000000001.seg".into(),
            refs: 2,
        };
        assert_eq!(
            err.to_string(),
            "file is in use by 2 lease(s): /data/idx/000000000001.seg"
        );

        let err = Error::ValueTooLarge { len: 65, max: 64 };
        assert_eq!(err.to_string(), "value too large: 65 bytes, max 64 bytes");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::DiskIo(_)));
    }
}
