//! Health status values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall health of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    /// Loading persisted state.
    Initializing,
    /// Loaded, transport not yet classified.
    Ready,
    /// Primary transport active and no consecutive failures.
    Optimal,
    /// Running on a fallback mechanism or after repeated failures.
    Degraded,
    /// Connectivity lost.
    Offline,
    /// No primary writer answered within the liveness window.
    PeerUnreachable,
    /// A full sync just completed.
    Synced,
}

impl SyncStatus {
    /// Returns true if the replica can currently apply mutations directly.
    pub fn is_online(&self) -> bool {
        !matches!(self, SyncStatus::Offline | SyncStatus::Initializing)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Initializing => "initializing",
            SyncStatus::Ready => "ready",
            SyncStatus::Optimal => "optimal",
            SyncStatus::Degraded => "degraded",
            SyncStatus::Offline => "offline",
            SyncStatus::PeerUnreachable => "peer-unreachable",
            SyncStatus::Synced => "synced",
        };
        f.write_str(name)
    }
}

/// Success and failure counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    /// Successfully handled operations.
    pub successes: u64,
    /// Failed operations.
    pub failures: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Milliseconds since the Unix epoch of the last completed sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<u64>,
    /// Duration of the last completed sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_duration_ms: Option<u64>,
}

/// Persisted form of the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Status at the time of the snapshot.
    pub status: SyncStatus,
    /// Counters at the time of the snapshot.
    pub metrics: SyncMetrics,
    /// Milliseconds since the Unix epoch of the snapshot.
    pub recorded_at: u64,
}
