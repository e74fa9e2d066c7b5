//! Error types for protocol values.

use crate::record::RecordId;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record does not have the required shape.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The same identifier appears twice in one collection.
    #[error("duplicate record id {0}")]
    DuplicateId(RecordId),
}

impl ProtocolError {
    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }
}
