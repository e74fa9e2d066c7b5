//! Health state machine.

use crate::clock::now_ms;
use parking_lot::RwLock;
use std::sync::Arc;
use tabsync_protocol::{StatusSnapshot, SyncMetrics, SyncStatus};
use tabsync_storage::KeyValueStore;
use tracing::{debug, info, warn};

/// Inputs to health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    /// Connectivity is available.
    pub online: bool,
    /// The primary transport mechanism is the active rung.
    pub primary_active: bool,
    /// A primary-writer replica was seen within the liveness window.
    pub primary_present: bool,
}

/// A status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Status before.
    pub from: SyncStatus,
    /// Status after.
    pub to: SyncStatus,
}

#[derive(Debug)]
struct MonitorState {
    status: SyncStatus,
    before_offline: Option<SyncStatus>,
    metrics: SyncMetrics,
}

/// Tracks [`SyncStatus`] and [`SyncMetrics`] and persists a snapshot on
/// every change.
///
/// The lifecycle is `initializing -> ready -> {optimal | degraded |
/// peer-unreachable}`, with `offline` entered on connectivity loss and left
/// to the status held before it. `synced` marks a completed full sync until
/// the next classification.
pub struct StatusMonitor {
    store: Arc<dyn KeyValueStore>,
    key: String,
    failure_threshold: u32,
    expect_primary: bool,
    state: RwLock<MonitorState>,
}

impl StatusMonitor {
    /// Creates a monitor in `initializing`, resuming counters from a
    /// persisted snapshot if one exists.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        failure_threshold: u32,
        expect_primary: bool,
    ) -> Self {
        let key = key.into();
        let metrics = match store.get(&key) {
            Ok(Some(json)) => match serde_json::from_str::<StatusSnapshot>(&json) {
                // The failure streak belongs to whichever replica wrote it.
                Ok(snapshot) => SyncMetrics {
                    consecutive_failures: 0,
                    ..snapshot.metrics
                },
                Err(e) => {
                    debug!(error = %e, "ignoring unreadable status snapshot");
                    SyncMetrics::default()
                }
            },
            Ok(None) => SyncMetrics::default(),
            Err(e) => {
                warn!(error = %e, "could not read status snapshot");
                SyncMetrics::default()
            }
        };
        Self {
            store,
            key,
            failure_threshold: failure_threshold.max(1),
            expect_primary,
            state: RwLock::new(MonitorState {
                status: SyncStatus::Initializing,
                before_offline: None,
                metrics,
            }),
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.state.read().status
    }

    /// Returns a copy of the metrics.
    pub fn metrics(&self) -> SyncMetrics {
        self.state.read().metrics.clone()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.read();
        StatusSnapshot {
            status: state.status,
            metrics: state.metrics.clone(),
            recorded_at: now_ms(),
        }
    }

    /// Returns true if consecutive failures reached the threshold.
    pub fn threshold_reached(&self) -> bool {
        self.state.read().metrics.consecutive_failures >= self.failure_threshold
    }

    /// Counts a successful operation.
    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.metrics.successes += 1;
        state.metrics.consecutive_failures = 0;
    }

    /// Counts a failed operation. Returns true if this failure reached the
    /// threshold.
    pub fn record_failure(&self) -> bool {
        let reached = {
            let mut state = self.state.write();
            state.metrics.failures += 1;
            state.metrics.consecutive_failures += 1;
            state.metrics.consecutive_failures == self.failure_threshold
        };
        if reached {
            warn!(threshold = self.failure_threshold, "consecutive failure threshold reached");
        }
        self.persist();
        reached
    }

    /// Records a completed full sync and marks the status `synced`.
    pub fn record_sync(&self, started_at: u64) -> Option<StatusChange> {
        let now = now_ms();
        {
            let mut state = self.state.write();
            state.metrics.last_sync_at = Some(now);
            state.metrics.last_sync_duration_ms = Some(now.saturating_sub(started_at));
        }
        match self.status() {
            SyncStatus::Offline | SyncStatus::Initializing => {
                self.persist();
                None
            }
            _ => self.set(SyncStatus::Synced),
        }
    }

    /// Leaves `initializing`.
    pub fn mark_ready(&self) -> Option<StatusChange> {
        match self.status() {
            SyncStatus::Initializing => self.set(SyncStatus::Ready),
            _ => None,
        }
    }

    /// Enters `offline`, remembering the current status.
    pub fn go_offline(&self) -> Option<StatusChange> {
        {
            let mut state = self.state.write();
            if state.status == SyncStatus::Offline {
                return None;
            }
            state.before_offline = Some(state.status);
        }
        self.set(SyncStatus::Offline)
    }

    /// Leaves `offline`, restoring the status held before it.
    pub fn go_online(&self) -> Option<StatusChange> {
        let restored = {
            let mut state = self.state.write();
            if state.status != SyncStatus::Offline {
                return None;
            }
            state.before_offline.take().unwrap_or(SyncStatus::Ready)
        };
        self.set(restored)
    }

    /// Maps health inputs to a status: `offline` over `degraded` over
    /// `peer-unreachable` over `optimal`.
    pub fn classify(&self, health: &Health) -> SyncStatus {
        if !health.online {
            SyncStatus::Offline
        } else if self.threshold_reached() || !health.primary_active {
            SyncStatus::Degraded
        } else if self.expect_primary && !health.primary_present {
            SyncStatus::PeerUnreachable
        } else {
            SyncStatus::Optimal
        }
    }

    /// Re-evaluates the status. `initializing` and `offline` are left only
    /// through [`StatusMonitor::mark_ready`] and [`StatusMonitor::go_online`].
    pub fn reclassify(&self, health: &Health) -> Option<StatusChange> {
        match self.status() {
            SyncStatus::Initializing | SyncStatus::Offline => None,
            _ => self.set(self.classify(health)),
        }
    }

    fn set(&self, status: SyncStatus) -> Option<StatusChange> {
        let change = {
            let mut state = self.state.write();
            if state.status == status {
                None
            } else {
                let change = StatusChange {
                    from: state.status,
                    to: status,
                };
                state.status = status;
                Some(change)
            }
        };
        if let Some(change) = change {
            info!(from = %change.from, to = %change.to, "status changed");
            self.persist();
        }
        change
    }

    fn persist(&self) {
        let snapshot = self.snapshot();
        let result = serde_json::to_string(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|json| self.store.set(&self.key, &json).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(error = %e, "could not persist status snapshot");
        }
    }
}

impl std::fmt::Debug for StatusMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusMonitor")
            .field("status", &self.status())
            .field("metrics", &self.metrics())
            .finish()
    }
}
