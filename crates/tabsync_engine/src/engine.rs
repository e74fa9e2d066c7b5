//! The sync engine.

use crate::clock::{now_ms, Clock};
use crate::config::EngineConfig;
use crate::conflicts::{ConflictKind, ConflictLog, ConflictRecord};
use crate::error::{SyncError, SyncResult};
use crate::observer::{ObserverRegistry, Subscription};
use crate::queue::{DrainReport, OfflineQueue};
use crate::remote::{with_retry, RecordPatch, RemoteFilter, RemoteOrder, RemoteStore};
use crate::status::{Health, StatusChange, StatusMonitor};
use crate::transport::{PrimaryChannel, TransportChannel, TransportMode};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tabsync_protocol::{
    merge_collections, ChangeMessage, ClaimStatus, IdGenerator, MessageType, QueueEntry,
    QueuedOperation, Record, RecordDraft, RecordId, ReplicaState, SyncMetrics, SyncStatus,
    WriterRole,
};
use tabsync_storage::KeyValueStore;
use tracing::{debug, info, warn};

/// Notifications for the rendering layer and other observers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The collection changed; carries every record in identifier order.
    RecordsChanged(Vec<Record>),
    /// A record appeared.
    RecordInserted(Record),
    /// A record was deleted.
    RecordRemoved(RecordId),
    /// The health status changed.
    StatusChanged(StatusChange),
    /// A mutation was queued for later replay.
    Queued(QueueEntry),
    /// A drain pass finished.
    QueueDrained {
        /// Entries replayed.
        applied: usize,
        /// Entries still queued.
        remaining: usize,
    },
    /// A conflict was logged.
    ConflictDetected(ConflictRecord),
    /// The conflict log was full and dropped its oldest entry.
    ConflictEvicted(ConflictRecord),
}

/// What a mutation did to the local collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedChange {
    /// A new record.
    Inserted(Record),
    /// A new version of an existing record.
    Updated(Record),
    /// A deletion.
    Removed(RecordId),
    /// Nothing changed: the collection already held this version or a newer
    /// one.
    Unchanged(RecordId),
}

/// What happened with the remote copy of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSync {
    /// The remote accepted the mutation.
    Confirmed,
    /// No remote store is configured.
    Skipped,
    /// Retries were exhausted; the mutation was queued for replay.
    Queued(QueueEntry),
    /// The remote refused the mutation with a non-retryable error.
    Rejected(String),
}

/// Result of [`SyncEngine::add`], [`SyncEngine::update`] and
/// [`SyncEngine::delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Applied locally and broadcast.
    Applied {
        /// Local effect.
        change: AppliedChange,
        /// Remote effect.
        remote: RemoteSync,
    },
    /// The replica is offline; the mutation waits in the queue.
    Queued(QueueEntry),
}

impl MutationOutcome {
    /// Returns true if the mutation was only queued.
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued(_))
    }
}

/// Summary of merging a snapshot into the local collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records that appeared.
    pub added: Vec<RecordId>,
    /// Records that changed.
    pub updated: Vec<RecordId>,
    /// Records that were deleted.
    pub removed: Vec<RecordId>,
    /// Identifier collisions that were separated.
    pub collisions: usize,
}

impl MergeReport {
    /// Returns true if the local collection changed.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

/// Builds a [`SyncEngine`] from its collaborators.
pub struct SyncEngineBuilder {
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    primary: Option<Arc<dyn PrimaryChannel>>,
    remote: Option<Arc<dyn RemoteStore>>,
    online: bool,
}

impl SyncEngineBuilder {
    /// Sets the same-device publish/subscribe channel.
    pub fn primary(mut self, channel: impl PrimaryChannel + 'static) -> Self {
        self.primary = Some(Arc::new(channel));
        self
    }

    /// Sets an already shared publish/subscribe channel.
    pub fn primary_shared(mut self, channel: Arc<dyn PrimaryChannel>) -> Self {
        self.primary = Some(channel);
        self
    }

    /// Sets the remote store.
    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets initial connectivity (default: online).
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Loads persisted state, starts the transport and announces the replica.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state is unreadable or no tokio runtime
    /// is running.
    pub async fn start(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        let store = self.store;
        let keys = &config.keys;

        let state = match store.get(&keys.collection)? {
            Some(json) => ReplicaState::from_json(&json)?,
            None => ReplicaState::new(),
        };
        let queue = OfflineQueue::load(Arc::clone(&store), keys.queue.clone())?;
        let monitor = StatusMonitor::new(
            Arc::clone(&store),
            keys.status.clone(),
            config.failure_threshold,
            config.expect_primary,
        );
        let transport = TransportChannel::new(&config, Arc::clone(&store), self.primary);
        if let Some(stamp) = read_stamp(store.as_ref(), &keys.last_update) {
            transport.note_local_update(stamp);
        }
        let clock = Clock::new();
        clock.observe(state.newest_timestamp());

        info!(
            replica = %config.replica_id,
            role = ?config.role,
            records = state.len(),
            pending = queue.len(),
            "starting sync engine"
        );

        let inner = Arc::new(EngineInner {
            ids: Mutex::new(IdGenerator::new(config.id_strategy, config.replica_id.clone())),
            conflicts: ConflictLog::new(config.conflict_retention),
            config,
            store,
            remote: self.remote,
            transport,
            queue,
            monitor,
            state: RwLock::new(state),
            clock,
            online: AtomicBool::new(self.online),
            shut_down: AtomicBool::new(false),
            observers: ObserverRegistry::new(),
            subscriptions: Mutex::new(Vec::new()),
            pending_sync: AtomicU64::new(0),
        });

        let engine = SyncEngine { inner };
        engine.wire_transport();
        engine.inner.transport.start()?;

        if let Some(change) = engine.inner.monitor.mark_ready() {
            engine.inner.emit(EngineEvent::StatusChanged(change));
        }
        if engine.is_online() {
            engine.inner.reclassify();
        } else if let Some(change) = engine.inner.monitor.go_offline() {
            engine.inner.emit(EngineEvent::StatusChanged(change));
        }

        engine.inner.announce(MessageType::PresenceOnline);
        if engine.inner.config.role == WriterRole::Secondary {
            engine.request_sync()?;
        }
        if engine.is_online() && !engine.inner.queue.is_empty() {
            engine.drain_queue().await?;
        }
        Ok(engine)
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    transport: TransportChannel,
    queue: OfflineQueue,
    monitor: StatusMonitor,
    conflicts: ConflictLog,
    state: RwLock<ReplicaState>,
    ids: Mutex<IdGenerator>,
    clock: Clock,
    online: AtomicBool,
    shut_down: AtomicBool,
    observers: ObserverRegistry<EngineEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
    pending_sync: AtomicU64,
}

/// A replica of the shared collection.
///
/// The engine applies local mutations, exchanges change messages with the
/// other replicas on the device, merges what it receives, queues mutations
/// while offline and mirrors them to an optional [`RemoteStore`].
///
/// Cloning yields another handle to the same replica.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tabsync_engine::{EngineConfig, LocalBus, SyncEngine};
/// use tabsync_protocol::{RecordDraft, WriterRole};
/// use tabsync_storage::MemoryStore;
///
/// # async fn demo() -> tabsync_engine::SyncResult<()> {
/// let store = MemoryStore::new();
/// let bus = LocalBus::new();
///
/// let engine = SyncEngine::builder(
///     EngineConfig::new(WriterRole::Secondary),
///     Arc::new(store.handle()),
/// )
/// .primary(bus.port())
/// .start()
/// .await?;
///
/// engine
///     .add(RecordDraft::new().with_field("title", "Blue Backpack"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Starts building an engine over `store`.
    pub fn builder(config: EngineConfig, store: Arc<dyn KeyValueStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            store,
            primary: None,
            remote: None,
            online: true,
        }
    }

    fn wire_transport(&self) {
        let weak = Arc::downgrade(&self.inner);
        let on_message = self.inner.transport.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let on_mode = self.inner.transport.on_mode_change(move |mode| {
            if let Some(inner) = weak.upgrade() {
                debug!(mode = %mode, "transport mode changed");
                inner.reclassify();
            }
        });

        self.inner.subscriptions.lock().extend([on_message, on_mode]);
    }

    /// Adds a record built from `draft`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for a malformed draft (never queued)
    /// and [`SyncError::Persistence`] if local storage fails.
    pub async fn add(&self, draft: RecordDraft) -> SyncResult<MutationOutcome> {
        self.inner.ensure_running()?;
        draft.validate(&self.inner.config.required_fields)?;

        let now = self.inner.clock.stamp();
        // Offline adds are not in the collection yet; skip their ids too.
        let pending: BTreeSet<RecordId> = self
            .inner
            .queue
            .entries()
            .iter()
            .map(|e| e.record_id().clone())
            .collect();
        let id = {
            let state = self.inner.state.read();
            let mut ids = self.inner.ids.lock();
            let mut id = ids.next_id(&state);
            while pending.contains(&id) {
                id = ids.next_id(&state);
            }
            id
        };
        let record = draft.into_record(
            id,
            now,
            self.inner.config.role.updated_by(),
            Some(self.inner.config.replica_id.clone()),
        );
        self.submit(QueuedOperation::Add { record }).await
    }

    /// Replaces a record with a new version stamped by this replica.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for a malformed record,
    /// [`SyncError::NotFound`] for an unknown identifier and
    /// [`SyncError::Persistence`] if local storage fails.
    pub async fn update(&self, mut record: Record) -> SyncResult<MutationOutcome> {
        self.inner.ensure_running()?;
        record.validate()?;
        let Some(current) = self.inner.current(&record.id) else {
            return Err(SyncError::NotFound(record.id));
        };

        record.last_updated = self.inner.clock.stamp();
        record.updated_by = self.inner.config.role.updated_by();
        if record.origin.is_none() {
            record.origin = current.origin;
        }
        self.submit(QueuedOperation::Update { record }).await
    }

    /// Marks a record claimed.
    ///
    /// # Errors
    ///
    /// Same as [`SyncEngine::update`].
    pub async fn claim(&self, id: &RecordId) -> SyncResult<MutationOutcome> {
        let record = self
            .inner
            .current(id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        self.update(record.with_status(ClaimStatus::Claimed)).await
    }

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] for an unknown identifier and
    /// [`SyncError::Persistence`] if local storage fails.
    pub async fn delete(&self, id: &RecordId) -> SyncResult<MutationOutcome> {
        self.inner.ensure_running()?;
        if id.is_blank() {
            return Err(SyncError::validation("record id is empty"));
        }
        if self.inner.current(id).is_none() {
            return Err(SyncError::NotFound(id.clone()));
        }
        let deleted_at = self.inner.clock.stamp();
        self.submit(QueuedOperation::Delete {
            id: id.clone(),
            deleted_at,
        })
        .await
    }

    async fn submit(&self, operation: QueuedOperation) -> SyncResult<MutationOutcome> {
        if !self.is_online() {
            let entry = self.inner.enqueue(operation)?;
            return Ok(MutationOutcome::Queued(entry));
        }

        let (change, mirrored) = self.inner.apply(&operation)?;
        let mut remote = RemoteSync::Skipped;
        for (i, operation) in mirrored.iter().enumerate() {
            remote = match self.inner.push_remote(operation).await {
                Ok(true) => RemoteSync::Confirmed,
                Ok(false) => RemoteSync::Skipped,
                Err(e) if e.is_retryable() => {
                    warn!(id = %operation.record_id(), error = %e, "remote retries exhausted; queueing");
                    let entry = self.inner.enqueue(operation.clone())?;
                    for rest in &mirrored[i + 1..] {
                        self.inner.enqueue(rest.clone())?;
                    }
                    RemoteSync::Queued(entry)
                }
                Err(e) => {
                    warn!(id = %operation.record_id(), error = %e, "remote rejected mutation");
                    RemoteSync::Rejected(e.to_string())
                }
            };
            if !matches!(remote, RemoteSync::Confirmed | RemoteSync::Skipped) {
                break;
            }
        }
        Ok(MutationOutcome::Applied { change, remote })
    }

    /// Asks the other replicas for their full state.
    ///
    /// The answer arrives asynchronously as a `sync_response`. When the
    /// primary mechanism is down the request cannot travel, so the shared
    /// collection is merged directly instead.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ShutDown`] after shutdown, or an error from the
    /// direct merge.
    pub fn request_sync(&self) -> SyncResult<()> {
        self.inner.ensure_running()?;
        let started = now_ms();
        self.inner.pending_sync.store(started, Ordering::SeqCst);

        if self.inner.transport.primary_active() {
            let request = self.inner.stamp(ChangeMessage::new(MessageType::SyncRequest, started));
            self.inner.transport.send(&request);
            debug!("sent sync request");
            return Ok(());
        }

        let stored = match self.inner.store.get(&self.inner.config.keys.collection)? {
            Some(json) => ReplicaState::from_json(&json)?,
            None => ReplicaState::new(),
        };
        self.inner.merge_state(&stored)?;
        self.inner.finish_sync();
        Ok(())
    }

    /// Switches connectivity. Going online restores the previous status and
    /// drains the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if draining hits a persistence failure.
    pub async fn set_online(&self, online: bool) -> SyncResult<Option<DrainReport>> {
        self.inner.ensure_running()?;
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);

        if !online {
            if let Some(change) = self.inner.monitor.go_offline() {
                self.inner.emit(EngineEvent::StatusChanged(change));
            }
            return Ok(None);
        }

        if let Some(change) = self.inner.monitor.go_online() {
            self.inner.emit(EngineEvent::StatusChanged(change));
        }
        if was_online && self.inner.queue.is_empty() {
            return Ok(None);
        }
        self.inner.reclassify();
        self.drain_queue().await.map(Some)
    }

    /// Replays queued mutations.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ShutDown`] after shutdown.
    pub async fn drain_queue(&self) -> SyncResult<DrainReport> {
        self.inner.ensure_running()?;
        if !self.is_online() {
            return Ok(DrainReport {
                remaining: self.inner.queue.len(),
                ..DrainReport::default()
            });
        }

        let inner = Arc::clone(&self.inner);
        let report = self
            .inner
            .queue
            .drain(move |entry| {
                let inner = Arc::clone(&inner);
                async move { inner.replay(entry.operation).await }
            })
            .await;

        if !report.busy {
            self.inner.emit(EngineEvent::QueueDrained {
                applied: report.applied,
                remaining: report.remaining,
            });
        }
        Ok(report)
    }

    /// Pulls every record from the remote store and merges it.
    ///
    /// # Errors
    ///
    /// Returns the remote error once retries are exhausted, or
    /// [`SyncError::Remote`] if no remote store is configured.
    pub async fn refresh_from_remote(&self) -> SyncResult<MergeReport> {
        self.inner.ensure_running()?;
        let Some(remote) = self.inner.remote.clone() else {
            return Err(SyncError::remote_fatal("no remote store configured"));
        };
        let started = now_ms();
        let filter = RemoteFilter::all();
        let records = with_retry(&self.inner.config.retry, "select", || {
            remote.select(&filter, RemoteOrder::ById)
        })
        .await?;

        let incoming = ReplicaState::from_records(records)?;
        let report = self.inner.merge_state(&incoming)?;
        if let Some(change) = self.inner.monitor.record_sync(started) {
            self.inner.emit(EngineEvent::StatusChanged(change));
        }
        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            "refreshed from remote"
        );
        Ok(report)
    }

    /// Registers an observer. Dispose the returned handle to stop receiving
    /// events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(handler)
    }

    /// Returns every record in identifier order.
    pub fn records(&self) -> Vec<Record> {
        self.inner.state.read().records().to_vec()
    }

    /// Returns one record.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.inner.state.read().get(id).cloned()
    }

    /// Returns a copy of the collection, tombstones included.
    pub fn state(&self) -> ReplicaState {
        self.inner.state.read().clone()
    }

    /// Returns the health status.
    pub fn status(&self) -> SyncStatus {
        self.inner.monitor.status()
    }

    /// Returns the success and failure counters.
    pub fn metrics(&self) -> SyncMetrics {
        self.inner.monitor.metrics()
    }

    /// Returns the queued mutations.
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.inner.queue.entries()
    }

    /// Returns the logged conflicts.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.conflicts.entries()
    }

    /// Returns the active transport rung.
    pub fn transport_mode(&self) -> TransportMode {
        self.inner.transport.mode()
    }

    /// Returns the transport, for inspection.
    pub fn transport(&self) -> &TransportChannel {
        &self.inner.transport
    }

    /// Returns this replica's id.
    pub fn replica_id(&self) -> &str {
        &self.inner.config.replica_id
    }

    /// Returns this replica's writer role.
    pub fn role(&self) -> WriterRole {
        self.inner.config.role
    }

    /// Returns true if the replica considers itself online.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Announces departure and stops every background task. Later mutations
    /// fail with [`SyncError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.inner.announce(MessageType::PresenceOffline);
        self.inner.shut_down.store(true, Ordering::SeqCst);

        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.dispose();
        }
        self.inner.transport.stop();
        if self.inner.config.role == WriterRole::Primary {
            if let Err(e) = self.inner.store.remove(&self.inner.config.keys.presence) {
                debug!(error = %e, "could not clear presence key");
            }
        }
        self.inner.observers.clear();
        info!(replica = %self.inner.config.replica_id, "sync engine shut down");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("replica", &self.inner.config.replica_id)
            .field("role", &self.inner.config.role)
            .field("status", &self.status())
            .field("records", &self.inner.state.read().len())
            .finish()
    }
}

impl EngineInner {
    fn ensure_running(&self) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: EngineEvent) {
        self.observers.emit(&event);
    }

    fn stamp(&self, message: ChangeMessage) -> ChangeMessage {
        message
            .from_role(self.config.role)
            .from_replica(self.config.replica_id.clone())
    }

    fn announce(&self, kind: MessageType) {
        self.transport.send(&self.stamp(ChangeMessage::new(kind, now_ms())));
    }

    fn reclassify(&self) {
        let health = Health {
            online: self.online.load(Ordering::SeqCst),
            primary_active: self.transport.primary_active(),
            primary_present: self.transport.is_primary_present(),
        };
        if let Some(change) = self.monitor.reclassify(&health) {
            self.emit(EngineEvent::StatusChanged(change));
        }
    }

    /// The live record, or the newest queued version of one added offline.
    fn current(&self, id: &RecordId) -> Option<Record> {
        if let Some(record) = self.state.read().get(id) {
            return Some(record.clone());
        }
        self.queue
            .entries()
            .into_iter()
            .rev()
            .find(|e| e.record_id() == id)
            .and_then(|e| match e.operation {
                QueuedOperation::Add { record } | QueuedOperation::Update { record } => Some(record),
                QueuedOperation::Delete { .. } => None,
            })
    }

    fn enqueue(&self, operation: QueuedOperation) -> SyncResult<QueueEntry> {
        let entry = self.queue.enqueue(operation, now_ms())?;
        self.emit(EngineEvent::Queued(entry.clone()));
        Ok(entry)
    }

    /// Writes the collection, then bumps the last-update key so that it
    /// always increases.
    fn persist(&self, state: &mut ReplicaState) -> SyncResult<u64> {
        let now = now_ms();
        let ttl = self.config.tombstone_ttl.as_millis() as u64;
        let pruned = state.prune_tombstones(now.saturating_sub(ttl));
        if pruned > 0 {
            debug!(pruned, "pruned expired tombstones");
        }

        self.store.set(&self.config.keys.collection, &state.to_json()?)?;
        let stored = read_stamp(self.store.as_ref(), &self.config.keys.last_update).unwrap_or(0);
        let stamp = now.max(stored.saturating_add(1));
        self.store
            .set(&self.config.keys.last_update, &stamp.to_string())?;
        self.transport.note_local_update(stamp);
        Ok(stamp)
    }

    /// Applies a mutation locally and returns the operations that mirror
    /// the result to the remote store.
    fn apply(&self, operation: &QueuedOperation) -> SyncResult<(AppliedChange, Vec<QueuedOperation>)> {
        if let QueuedOperation::Add { record } = operation {
            let (collides, relocated) = {
                let state = self.state.read();
                let collides = state.get(&record.id).is_some_and(|existing| {
                    matches!((&existing.origin, &record.origin), (Some(a), Some(b)) if a != b)
                });
                let relocated = record.origin.as_deref().and_then(|origin| {
                    let moved = moved_id(&record.id, origin);
                    state
                        .get(&moved)
                        .filter(|r| r.origin == record.origin)
                        .map(|_| moved)
                });
                (collides, relocated)
            };
            if let Some(moved) = relocated {
                // Already separated by an earlier merge; this is an update
                // of the relocated copy.
                let mut record = record.clone();
                record.id = moved;
                let operation = QueuedOperation::Add { record };
                let change = self.apply_local(&operation)?;
                return Ok((change, vec![operation]));
            }
            if collides {
                return self.apply_colliding_add(record);
            }
        }
        let change = self.apply_local(operation)?;
        Ok((change, vec![operation.clone()]))
    }

    /// Adds a record whose identifier another replica already minted. Both
    /// records are kept under the merge rules and the collision is logged.
    fn apply_colliding_add(
        &self,
        record: &Record,
    ) -> SyncResult<(AppliedChange, Vec<QueuedOperation>)> {
        let existing_origin = self
            .state
            .read()
            .get(&record.id)
            .and_then(|r| r.origin.clone());
        self.merge_state(&ReplicaState::from_records(vec![record.clone()])?)?;

        let snapshot = self.state.read().clone();
        let touched: Vec<RecordId> = [record.origin.as_deref(), existing_origin.as_deref()]
            .into_iter()
            .flatten()
            .map(|origin| moved_id(&record.id, origin))
            .chain(std::iter::once(record.id.clone()))
            .filter(|id| snapshot.contains(id))
            .collect();
        let applied = touched
            .iter()
            .filter_map(|id| snapshot.get(id))
            .find(|r| r.origin == record.origin)
            .cloned();

        let stamp = read_stamp(self.store.as_ref(), &self.config.keys.last_update)
            .unwrap_or_else(now_ms);
        self.transport
            .send(&self.stamp(ChangeMessage::data_update(&snapshot, stamp)));

        let mirrored = touched
            .iter()
            .filter_map(|id| snapshot.get(id))
            .map(|r| QueuedOperation::Add { record: r.clone() })
            .collect();
        let change = match applied {
            Some(applied) => AppliedChange::Inserted(applied),
            None => AppliedChange::Unchanged(record.id.clone()),
        };
        Ok((change, mirrored))
    }

    /// Applies one mutation to the collection, persists it and broadcasts
    /// the new state. Stale versions leave the collection untouched.
    fn apply_local(&self, operation: &QueuedOperation) -> SyncResult<AppliedChange> {
        let (change, snapshot, stamp) = {
            let mut state = self.state.write();
            let mut next = state.clone();

            let change = match operation {
                QueuedOperation::Add { record } | QueuedOperation::Update { record } => {
                    let deleted_after = next
                        .tombstone(&record.id)
                        .is_some_and(|t| t >= record.last_updated);
                    match next.get(&record.id) {
                        _ if deleted_after => AppliedChange::Unchanged(record.id.clone()),
                        Some(existing)
                            if existing == record || existing.last_updated > record.last_updated =>
                        {
                            AppliedChange::Unchanged(record.id.clone())
                        }
                        existing => {
                            let mut record = record.clone();
                            let inserted = existing.is_none();
                            if let Some(existing) = existing {
                                record.status = record.status.max(existing.status);
                            }
                            next.upsert(record.clone());
                            if inserted {
                                AppliedChange::Inserted(record)
                            } else {
                                AppliedChange::Updated(record)
                            }
                        }
                    }
                }
                QueuedOperation::Delete { id, deleted_at } => {
                    let stale = next.get(id).is_some_and(|r| r.last_updated > *deleted_at)
                        || next.tombstone(id).is_some_and(|t| t >= *deleted_at);
                    if stale {
                        AppliedChange::Unchanged(id.clone())
                    } else {
                        next.remove(id, *deleted_at);
                        AppliedChange::Removed(id.clone())
                    }
                }
            };

            if matches!(change, AppliedChange::Unchanged(_)) {
                return Ok(change);
            }
            let stamp = self.persist(&mut next)?;
            *state = next.clone();
            (change, next, stamp)
        };

        debug!(change = ?change, stamp, "applied local mutation");
        self.transport
            .send(&self.stamp(ChangeMessage::data_update(&snapshot, stamp)));

        match &change {
            AppliedChange::Inserted(record) => self.emit(EngineEvent::RecordInserted(record.clone())),
            AppliedChange::Removed(id) => self.emit(EngineEvent::RecordRemoved(id.clone())),
            _ => {}
        }
        self.emit(EngineEvent::RecordsChanged(snapshot.into_records()));
        Ok(change)
    }

    /// Mirrors a mutation to the remote store. Returns false if there is
    /// none.
    async fn push_remote(&self, operation: &QueuedOperation) -> SyncResult<bool> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(false);
        };
        let retry = &self.config.retry;
        match operation {
            QueuedOperation::Add { record } => {
                with_retry(retry, "insert", || remote.insert(record)).await?;
            }
            QueuedOperation::Update { record } => {
                let patch = RecordPatch::from_record(record);
                with_retry(retry, "update", || remote.update(&record.id, &patch)).await?;
            }
            QueuedOperation::Delete { id, .. } => {
                with_retry(retry, "delete", || remote.delete(id)).await?;
            }
        }
        Ok(true)
    }

    async fn replay(&self, operation: QueuedOperation) -> SyncResult<()> {
        self.ensure_running()?;
        let (_, mirrored) = self.apply(&operation)?;
        for operation in &mirrored {
            self.push_remote(operation).await?;
        }
        Ok(())
    }

    /// Merges a snapshot into the collection, persisting and notifying if
    /// anything changed.
    fn merge_state(&self, incoming: &ReplicaState) -> SyncResult<MergeReport> {
        self.clock.observe(incoming.newest_timestamp());
        let merged_at = self.clock.stamp();

        let (outcome, persisted) = {
            let mut state = self.state.write();
            let outcome = merge_collections(&state, incoming, merged_at);
            if outcome.state == *state {
                (outcome, None)
            } else {
                let mut next = outcome.state.clone();
                self.persist(&mut next)?;
                *state = next.clone();
                (outcome, Some(next))
            }
        };

        let report = MergeReport {
            added: outcome.added.clone(),
            updated: outcome.updated.clone(),
            removed: outcome.removed.clone(),
            collisions: outcome.collisions.len(),
        };

        if let Some(next) = persisted {
            for id in &outcome.added {
                if let Some(record) = next.get(id) {
                    self.emit(EngineEvent::RecordInserted(record.clone()));
                }
            }
            for id in &outcome.removed {
                self.emit(EngineEvent::RecordRemoved(id.clone()));
            }
            debug!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "merged incoming state"
            );
            self.emit(EngineEvent::RecordsChanged(next.into_records()));
        }

        if !outcome.collisions.is_empty() {
            let mut involved = Vec::new();
            for collision in &outcome.collisions {
                let records: Vec<Record> = [&collision.id, &collision.moved_to]
                    .into_iter()
                    .filter_map(|id| outcome.state.get(id).cloned())
                    .collect();
                involved.extend(records.iter().cloned());
                warn!(
                    id = %collision.id,
                    moved_to = %collision.moved_to,
                    "identifier collision separated"
                );
                self.log_conflict(ConflictRecord {
                    id: Some(collision.id.clone()),
                    kind: ConflictKind::IdCollision(collision.clone()),
                    records,
                    detected_at: now_ms(),
                });
            }
            let notice = self.stamp(ChangeMessage::conflict_notice(involved, now_ms()));
            self.transport.send(&notice);
        }

        Ok(report)
    }

    fn log_conflict(&self, conflict: ConflictRecord) {
        let evicted = self.conflicts.push(conflict.clone());
        self.emit(EngineEvent::ConflictDetected(conflict));
        if let Some(evicted) = evicted {
            debug!(retention = self.conflicts.retention(), "conflict log full; evicting oldest");
            self.emit(EngineEvent::ConflictEvicted(evicted));
        }
    }

    fn finish_sync(&self) {
        let started = self.pending_sync.swap(0, Ordering::SeqCst);
        if started == 0 {
            return;
        }
        if let Some(change) = self.monitor.record_sync(started) {
            self.emit(EngineEvent::StatusChanged(change));
        }
    }

    fn handle_message(&self, message: &ChangeMessage) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if message.replica.as_deref() == Some(self.config.replica_id.as_str()) {
            return;
        }

        let result = match message.kind {
            MessageType::DataUpdate | MessageType::SyncResponse | MessageType::ConflictNotice => {
                self.handle_snapshot(message)
            }
            MessageType::SyncRequest => {
                self.answer_sync_request(message);
                Ok(())
            }
            MessageType::PresenceOnline | MessageType::PresenceOffline => {
                debug!(kind = message.kind.as_str(), replica = ?message.replica, "presence");
                Ok(())
            }
            MessageType::Ping | MessageType::Pong | MessageType::Unknown => Ok(()),
        };

        match result {
            Ok(()) => {
                self.monitor.record_success();
                self.transport.record_success();
                self.reclassify();
                if message.kind == MessageType::SyncResponse {
                    self.finish_sync();
                }
            }
            Err(e) => {
                warn!(kind = message.kind.as_str(), replica = ?message.replica, error = %e, "dropping inbound message");
                if message.kind == MessageType::SyncResponse {
                    self.log_conflict(ConflictRecord {
                        id: None,
                        kind: ConflictKind::MalformedSnapshot {
                            sender: message.replica.clone(),
                            reason: e.to_string(),
                        },
                        records: message.data.clone().unwrap_or_default(),
                        detected_at: now_ms(),
                    });
                }
                let reached = self.monitor.record_failure();
                self.transport.record_failure();
                if reached {
                    self.transport.force_fallback();
                }
                self.reclassify();
            }
        }
    }

    fn handle_snapshot(&self, message: &ChangeMessage) -> SyncResult<()> {
        let Some(incoming) = message
            .snapshot()
            .map_err(|e| SyncError::merge(e.to_string()))?
        else {
            return Ok(());
        };
        self.merge_state(&incoming)?;

        // Answer only data updates, and only when the sender is missing
        // something; responses are never answered.
        if message.kind == MessageType::DataUpdate {
            let merged = self.state.read().clone();
            if merged != incoming {
                debug!(replica = ?message.replica, "sender is behind; answering with full state");
                self.transport
                    .send(&self.stamp(ChangeMessage::sync_response(&merged, now_ms())));
            }
        }
        Ok(())
    }

    fn answer_sync_request(&self, message: &ChangeMessage) {
        let answer = self.config.role == WriterRole::Primary || !self.transport.is_primary_present();
        if !answer {
            return;
        }
        debug!(requester = ?message.replica, "answering sync request");
        let state = self.state.read().clone();
        self.transport
            .send(&self.stamp(ChangeMessage::sync_response(&state, now_ms())));
    }
}

fn moved_id(id: &RecordId, origin: &str) -> RecordId {
    RecordId::new(format!("{id}~{origin}"))
}

fn read_stamp(store: &dyn KeyValueStore, key: &str) -> Option<u64> {
    match store.get(key) {
        Ok(Some(raw)) => raw.trim().parse().ok(),
        Ok(None) => None,
        Err(e) => {
            debug!(error = %e, key, "could not read stamp");
            None
        }
    }
}
