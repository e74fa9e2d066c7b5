//! Error types for the sync engine.

use tabsync_protocol::{ProtocolError, RecordId};
use tabsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A transport mechanism could not be built or failed to send.
    #[error("transport error: {0}")]
    Transport(String),

    /// Incoming data could not be merged.
    #[error("merge error: {0}")]
    Merge(String),

    /// Local storage failed; fatal for the operation.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// The remote collaborator failed.
    #[error("remote error: {message}")]
    Remote {
        /// Error message.
        message: String,
        /// Whether the call can be retried.
        retryable: bool,
    },

    /// Caller input is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The record does not exist locally.
    #[error("record {0} not found")]
    NotFound(RecordId),

    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The engine was shut down.
    #[error("engine has shut down")]
    ShutDown,
}

impl SyncError {
    /// Creates a retryable remote error.
    pub fn remote_retryable(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable remote error.
    pub fn remote_fatal(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a merge error.
    pub fn merge(message: impl Into<String>) -> Self {
        Self::Merge(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote { retryable, .. } => *retryable,
            SyncError::Transport(_) => true,
            _ => false,
        }
    }

    /// Returns true if the error is a storage quota failure.
    pub fn is_quota(&self) -> bool {
        matches!(self, SyncError::Persistence(e) if e.is_quota())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Json(e) => SyncError::Codec(e),
            ProtocolError::InvalidRecord(message) => SyncError::Validation(message),
            ProtocolError::DuplicateId(id) => SyncError::Merge(format!("duplicate record id {id}")),
        }
    }
}
