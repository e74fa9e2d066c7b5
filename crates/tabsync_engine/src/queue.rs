//! Durable FIFO of mutations awaiting replay.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tabsync_protocol::{QueueEntry, QueuedOperation, RecordId};
use tabsync_storage::KeyValueStore;
use tracing::{debug, info, warn};

/// Outcome of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Entries replayed and removed.
    pub applied: usize,
    /// Entries whose replay failed; they stay queued.
    pub failed: usize,
    /// Entries held back because an earlier entry for the same record failed.
    pub skipped: usize,
    /// Entries left in the queue after the pass.
    pub remaining: usize,
    /// Replay errors by entry sequence number.
    pub errors: Vec<(u64, SyncError)>,
    /// True if the pass did nothing because another drain was running.
    pub busy: bool,
}

impl DrainReport {
    /// Returns true if the queue was emptied.
    pub fn is_complete(&self) -> bool {
        !self.busy && self.remaining == 0
    }
}

/// A persisted queue of offline mutations.
///
/// # Invariants
///
/// - The persisted copy always matches the in-memory entries
/// - An entry is removed only after its replay succeeded
/// - Within a pass, entries for one record replay in submission order; once
///   one fails the rest for that record wait for the next pass
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    entries: Mutex<VecDeque<QueueEntry>>,
    next_seq: AtomicU64,
    draining: AtomicBool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    /// Loads the queue persisted under `key`, or starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the persisted queue is
    /// malformed.
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> SyncResult<Self> {
        let key = key.into();
        let entries: VecDeque<QueueEntry> = match store.get(&key)? {
            Some(json) => serde_json::from_str(&json)?,
            None => VecDeque::new(),
        };
        let next_seq = entries.iter().map(|e| e.seq).max().map_or(1, |s| s.saturating_add(1));
        if !entries.is_empty() {
            info!(pending = entries.len(), "loaded offline queue");
        }
        Ok(Self {
            store,
            key,
            entries: Mutex::new(entries),
            next_seq: AtomicU64::new(next_seq),
            draining: AtomicBool::new(false),
        })
    }

    /// Appends an operation and persists the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Persistence`] if the queue cannot be written,
    /// including quota failures. The operation is not queued in that case.
    pub fn enqueue(&self, operation: QueuedOperation, now: u64) -> SyncResult<QueueEntry> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = QueueEntry::new(seq, operation, now);

        let mut entries = self.entries.lock();
        entries.push_back(entry.clone());
        if let Err(e) = self.persist(&entries) {
            entries.pop_back();
            warn!(seq, error = %e, "could not persist queued mutation");
            return Err(e);
        }
        debug!(
            seq,
            operation = entry.operation.name(),
            id = %entry.record_id(),
            pending = entries.len(),
            "queued mutation"
        );
        Ok(entry)
    }

    /// Returns the number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns a copy of the pending entries in submission order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Returns true while a drain pass is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Replays pending entries in order through `apply`.
    ///
    /// Entries queued while the pass runs wait for the next pass. A second
    /// drain started while one runs returns immediately with
    /// [`DrainReport::busy`] set.
    pub async fn drain<F, Fut>(&self, mut apply: F) -> DrainReport
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = SyncResult<()>>,
    {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("drain already running");
            return DrainReport {
                busy: true,
                remaining: self.len(),
                ..DrainReport::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let pending = self.entries();
        let mut report = DrainReport::default();
        let mut blocked: BTreeSet<RecordId> = BTreeSet::new();

        for entry in pending {
            if blocked.contains(entry.record_id()) {
                report.skipped += 1;
                continue;
            }
            let seq = entry.seq;
            let id = entry.record_id().clone();

            match apply(entry).await {
                Ok(()) => {
                    if let Err(e) = self.remove(seq) {
                        // The entry was applied but stays on disk; replay is
                        // idempotent for merges, so stop and retry later.
                        warn!(seq, error = %e, "could not persist drained queue");
                        report.errors.push((seq, e));
                        break;
                    }
                    report.applied += 1;
                }
                Err(e) => {
                    debug!(seq, id = %id, error = %e, "replay failed; entry stays queued");
                    blocked.insert(id);
                    report.failed += 1;
                    report.errors.push((seq, e));
                }
            }
        }

        report.remaining = self.len();
        info!(
            applied = report.applied,
            failed = report.failed,
            skipped = report.skipped,
            remaining = report.remaining,
            "drained offline queue"
        );
        report
    }

    fn remove(&self, seq: u64) -> SyncResult<()> {
        let mut entries = self.entries.lock();
        let Some(position) = entries.iter().position(|e| e.seq == seq) else {
            return Ok(());
        };
        let removed = entries.remove(position);
        if let Err(e) = self.persist(&entries) {
            if let Some(entry) = removed {
                entries.insert(position, entry);
            }
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, entries: &VecDeque<QueueEntry>) -> SyncResult<()> {
        let json = serde_json::to_string(entries)?;
        self.store.set(&self.key, &json)?;
        Ok(())
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("key", &self.key)
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_protocol::{Record, UpdatedBy};
    use tabsync_storage::{MemoryStore, StorageError};

    const KEY: &str = "tabsync:queue";

    fn add(id: &str) -> QueuedOperation {
        QueuedOperation::Add {
            record: Record::new(id, 1, UpdatedBy::SecondaryWriter).with_field("title", id),
        }
    }

    fn delete(id: &str) -> QueuedOperation {
        QueuedOperation::Delete {
            id: RecordId::new(id),
            deleted_at: 2,
        }
    }

    #[test]
    fn enqueue_persists_and_reloads() {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::load(store.clone(), KEY).unwrap();
        queue.enqueue(add("1"), 10).unwrap();
        queue.enqueue(delete("1"), 11).unwrap();
        assert_eq!(queue.len(), 2);

        let reloaded = OfflineQueue::load(store, KEY).unwrap();
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[1].operation.name(), "delete");

        let next = reloaded.enqueue(add("2"), 12).unwrap();
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn quota_failure_is_not_queued() {
        let store = Arc::new(MemoryStore::with_quota(64));
        let queue = OfflineQueue::load(store, KEY).unwrap();
        let err = queue.enqueue(add("1"), 1).unwrap_err();
        assert!(err.is_quota());
        assert!(matches!(
            err,
            SyncError::Persistence(StorageError::QuotaExceeded { .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn malformed_queue_fails_to_load() {
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "[{").unwrap();
        assert!(matches!(
            OfflineQueue::load(store, KEY),
            Err(SyncError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn drain_replays_in_order() {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::load(store.clone(), KEY).unwrap();
        queue.enqueue(add("1"), 1).unwrap();
        queue.enqueue(add("2"), 2).unwrap();
        queue.enqueue(delete("1"), 3).unwrap();

        let seen = Mutex::new(Vec::new());
        let report = queue
            .drain(|entry| {
                seen.lock().push(entry.seq);
                async { Ok(()) }
            })
            .await;

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(report.applied, 3);
        assert!(report.is_complete());
        assert!(queue.is_empty());
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn failed_entry_blocks_later_entries_for_same_record() {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::load(store, KEY).unwrap();
        queue.enqueue(add("1"), 1).unwrap();
        queue.enqueue(add("2"), 2).unwrap();
        queue.enqueue(delete("1"), 3).unwrap();

        let report = queue
            .drain(|entry| async move {
                if entry.record_id().as_str() == "1" {
                    Err(SyncError::remote_retryable("unavailable"))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.errors[0].0, 1);

        let left: Vec<u64> = queue.entries().iter().map(|e| e.seq).collect();
        assert_eq!(left, vec![1, 3]);
    }

    #[tokio::test]
    async fn concurrent_drain_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(OfflineQueue::load(store, KEY).unwrap());
        queue.enqueue(add("1"), 1).unwrap();

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Mutex::new(Some(release_rx));

        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .drain(|_| {
                        let rx = release_rx.lock().take();
                        async move {
                            if let Some(rx) = rx {
                                let _ = rx.await;
                            }
                            Ok(())
                        }
                    })
                    .await
            })
        };

        while !queue.is_draining() {
            tokio::task::yield_now().await;
        }
        let second = queue.drain(|_| async { Ok(()) }).await;
        assert!(second.busy);
        assert_eq!(second.applied, 0);

        release_tx.send(()).unwrap();
        let first = first.await.unwrap();
        assert_eq!(first.applied, 1);
        assert!(!queue.is_draining());
    }
}
