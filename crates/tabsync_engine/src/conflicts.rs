//! Bounded log of conflicts that merging could not settle silently.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tabsync_protocol::{IdCollision, Record, RecordId};

/// Why a conflict was logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Two replicas minted the same identifier; the records were separated.
    IdCollision(IdCollision),
    /// An incoming snapshot could not be merged.
    MalformedSnapshot {
        /// Replica that sent it, if known.
        sender: Option<String>,
        /// Decoding error.
        reason: String,
    },
}

/// One logged conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Identifier involved, if any.
    pub id: Option<RecordId>,
    /// What happened.
    pub kind: ConflictKind,
    /// The records involved, for review.
    pub records: Vec<Record>,
    /// Milliseconds since the Unix epoch.
    pub detected_at: u64,
}

/// Keeps the most recent conflicts up to a fixed retention.
#[derive(Debug)]
pub struct ConflictLog {
    retention: usize,
    entries: Mutex<VecDeque<ConflictRecord>>,
}

impl ConflictLog {
    /// Creates a log holding at most `retention` entries.
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            retention,
            entries: Mutex::new(VecDeque::with_capacity(retention.min(64))),
        }
    }

    /// Appends a conflict. Returns the oldest entry if it had to be evicted.
    pub fn push(&self, conflict: ConflictRecord) -> Option<ConflictRecord> {
        let mut entries = self.entries.lock();
        entries.push_back(conflict);
        if entries.len() > self.retention {
            entries.pop_front()
        } else {
            None
        }
    }

    /// Returns the logged conflicts, oldest first.
    pub fn entries(&self) -> Vec<ConflictRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Removes the conflicts about `id`. Returns how many were removed.
    pub fn resolve(&self, id: &RecordId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|c| c.id.as_ref() != Some(id));
        before - entries.len()
    }

    /// Returns the number of logged conflicts.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is logged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the maximum number of entries kept.
    pub fn retention(&self) -> usize {
        self.retention
    }
}
