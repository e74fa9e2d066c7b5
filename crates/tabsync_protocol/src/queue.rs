//! Persisted offline mutations.

use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};

/// A mutation that could not be applied when it was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum QueuedOperation {
    /// Insert a new record.
    Add {
        /// The record, with identity already assigned.
        record: Record,
    },
    /// Replace an existing record.
    Update {
        /// The new version.
        record: Record,
    },
    /// Delete a record.
    Delete {
        /// Identifier to delete.
        id: RecordId,
        /// Time of the deletion request.
        #[serde(rename = "deletedAt")]
        deleted_at: u64,
    },
}

impl QueuedOperation {
    /// Returns the identifier the operation targets.
    pub fn record_id(&self) -> &RecordId {
        match self {
            QueuedOperation::Add { record } | QueuedOperation::Update { record } => &record.id,
            QueuedOperation::Delete { id, .. } => id,
        }
    }

    /// Returns the operation name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            QueuedOperation::Add { .. } => "add",
            QueuedOperation::Update { .. } => "update",
            QueuedOperation::Delete { .. } => "delete",
        }
    }
}

/// An entry of the offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Position in submission order, unique within a queue.
    pub seq: u64,
    /// The mutation.
    #[serde(flatten)]
    pub operation: QueuedOperation,
    /// Milliseconds since the Unix epoch when the entry was queued.
    pub enqueued_at: u64,
}

impl QueueEntry {
    /// Creates an entry.
    pub fn new(seq: u64, operation: QueuedOperation, enqueued_at: u64) -> Self {
        Self {
            seq,
            operation,
            enqueued_at,
        }
    }

    /// Returns the identifier the entry targets.
    pub fn record_id(&self) -> &RecordId {
        self.operation.record_id()
    }
}
