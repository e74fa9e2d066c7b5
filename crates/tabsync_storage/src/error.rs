//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write would exceed the store's quota.
    #[error("storage quota exceeded: {required} bytes required, quota is {quota}")]
    QuotaExceeded {
        /// Bytes the store would hold after the write.
        required: usize,
        /// Configured quota in bytes.
        quota: usize,
    },

    /// The key cannot be stored by this backend.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// The stored value is not valid UTF-8 text.
    #[error("stored value for {key:?} is not valid UTF-8")]
    Corrupted {
        /// Key whose value could not be read.
        key: String,
    },
}

impl StorageError {
    /// Returns true if the error is a quota failure.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}
