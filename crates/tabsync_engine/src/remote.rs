//! The remote persistence collaborator.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tabsync_protocol::{ClaimStatus, Record, RecordId, UpdatedBy};
use tracing::debug;

/// Selects records on the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFilter {
    /// Only these identifiers, if set.
    pub ids: Option<Vec<RecordId>>,
    /// Only records with this claim status, if set.
    pub status: Option<ClaimStatus>,
    /// Field values that must match exactly.
    pub field_equals: BTreeMap<String, String>,
}

impl RemoteFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to the given identifiers.
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts to a claim status.
    pub fn with_status(mut self, status: ClaimStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Requires a field to equal `value`.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_equals.insert(name.into(), value.into());
        self
    }

    /// Returns true if `record` passes the filter.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        self.field_equals
            .iter()
            .all(|(name, value)| record.fields.get(name) == Some(value))
    }
}

/// Result ordering for [`RemoteStore::select`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoteOrder {
    /// Identifier order.
    #[default]
    ById,
    /// Most recently updated first.
    NewestFirst,
    /// Least recently updated first.
    OldestFirst,
}

impl RemoteOrder {
    /// Sorts `records` in this order.
    pub fn sort(self, records: &mut [Record]) {
        match self {
            RemoteOrder::ById => records.sort_by(|a, b| a.id.cmp(&b.id)),
            RemoteOrder::NewestFirst => records.sort_by(|a, b| {
                b.last_updated.cmp(&a.last_updated).then_with(|| a.id.cmp(&b.id))
            }),
            RemoteOrder::OldestFirst => records.sort_by(|a, b| {
                a.last_updated.cmp(&b.last_updated).then_with(|| a.id.cmp(&b.id))
            }),
        }
    }
}

/// A partial update of a remote record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    /// Fields to overwrite.
    pub fields: BTreeMap<String, String>,
    /// New claim status.
    pub status: Option<ClaimStatus>,
    /// New write time.
    pub last_updated: Option<u64>,
    /// New producer marker.
    pub updated_by: Option<UpdatedBy>,
}

impl RecordPatch {
    /// A patch that makes the remote record equal to `record`.
    pub fn from_record(record: &Record) -> Self {
        Self {
            fields: record.fields.clone(),
            status: Some(record.status),
            last_updated: Some(record.last_updated),
            updated_by: Some(record.updated_by),
        }
    }

    /// Applies the patch.
    pub fn apply_to(&self, record: &mut Record) {
        for (name, value) in &self.fields {
            record.fields.insert(name.clone(), value.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(last_updated) = self.last_updated {
            record.last_updated = last_updated;
        }
        if let Some(updated_by) = self.updated_by {
            record.updated_by = updated_by;
        }
    }
}

/// Remote persistent storage consumed by the engine.
///
/// Every call may fail; [`SyncError::Remote`] carries whether a retry can
/// help.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads records.
    async fn select(&self, filter: &RemoteFilter, order: RemoteOrder) -> SyncResult<Vec<Record>>;

    /// Stores a new record, replacing a record with the same identifier.
    async fn insert(&self, record: &Record) -> SyncResult<Record>;

    /// Patches an existing record.
    async fn update(&self, id: &RecordId, patch: &RecordPatch) -> SyncResult<Record>;

    /// Deletes a record. Deleting a missing record succeeds.
    async fn delete(&self, id: &RecordId) -> SyncResult<()>;
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is reached, sleeping with exponential backoff in
/// between.
///
/// # Errors
///
/// Returns the last error.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut call: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(operation, attempt, ?delay, error = %e, "retrying remote call");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// An in-memory [`RemoteStore`] with switchable failures.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    records: RwLock<BTreeMap<RecordId, Record>>,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    reject: AtomicBool,
    calls: AtomicU64,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a remote holding `records`.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let remote = Self::new();
        {
            let mut map = remote.records.write();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        remote
    }

    /// Makes the next `count` calls fail with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Makes every call fail with a retryable error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every call fail with a non-retryable error until switched back.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Returns the number of calls made, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns a copy of the stored records in identifier order.
    pub fn records(&self) -> Vec<Record> {
        self.records.read().values().cloned().collect()
    }

    /// Returns one stored record.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    fn check(&self) -> SyncResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(SyncError::remote_fatal("request rejected"));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::remote_retryable("service unavailable"));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SyncError::remote_retryable("transient failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, filter: &RemoteFilter, order: RemoteOrder) -> SyncResult<Vec<Record>> {
        self.check()?;
        let mut records: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        order.sort(&mut records);
        Ok(records)
    }

    async fn insert(&self, record: &Record) -> SyncResult<Record> {
        self.check()?;
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(record.clone())
    }

    async fn update(&self, id: &RecordId, patch: &RecordPatch) -> SyncResult<Record> {
        self.check()?;
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| SyncError::remote_fatal(format!("record {id} does not exist")))?;
        patch.apply_to(record);
        Ok(record.clone())
    }

    async fn delete(&self, id: &RecordId) -> SyncResult<()> {
        self.check()?;
        self.records.write().remove(id);
        Ok(())
    }
}
