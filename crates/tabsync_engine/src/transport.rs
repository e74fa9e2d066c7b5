//! Change notification delivery between replicas on one device.
//!
//! Three mechanisms form a ladder. A replica sends through the highest rung
//! that still works and drops one rung on every failure:
//!
//! 1. A [`PrimaryChannel`] (in process: [`LocalBus`]).
//! 2. A sentinel key in the shared store, for stores that report writes.
//! 3. Polling of the last-update key.
//!
//! Receiving always uses every available mechanism, and polling always runs.
//! Duplicate deliveries are harmless because merging is idempotent.

use crate::clock::now_ms;
use crate::config::{EngineConfig, StorageKeys, TransportConfig};
use crate::error::{SyncError, SyncResult};
use crate::observer::{ObserverRegistry, Subscription};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tabsync_protocol::{ChangeMessage, MessageType, ReplicaState, WriterRole};
use tabsync_storage::{KeyValueStore, StoreWatcher};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A same-device publish/subscribe primitive.
///
/// Implementations must not deliver a message back to the endpoint that
/// posted it.
pub trait PrimaryChannel: Send + Sync {
    /// Publishes a message to every other endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] if the message could not be handed to
    /// the medium.
    fn post(&self, message: &ChangeMessage) -> SyncResult<()>;

    /// Starts receiving messages posted by other endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] if the medium cannot be subscribed to.
    fn listen(&self) -> SyncResult<mpsc::UnboundedReceiver<ChangeMessage>>;
}

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Frame {
    sender: u64,
    payload: Arc<str>,
}

#[derive(Debug)]
struct BusShared {
    sender: broadcast::Sender<Frame>,
    next_port: AtomicU64,
    closed: AtomicBool,
}

/// In-process message bus shared by the replicas of one device.
///
/// Messages travel as JSON text, as they would between browser contexts.
#[derive(Debug, Clone)]
pub struct LocalBus {
    shared: Arc<BusShared>,
}

impl LocalBus {
    /// Creates a bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            shared: Arc::new(BusShared {
                sender,
                next_port: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a new endpoint on the bus.
    pub fn port(&self) -> BusPort {
        BusPort {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_port.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Closes the bus. Every later post fails.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true if the bus was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Publishes raw text to every endpoint, bypassing encoding.
    pub fn publish_raw(&self, payload: &str) {
        let _ = self.shared.sender.send(Frame {
            sender: 0,
            payload: Arc::from(payload),
        });
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`LocalBus`].
#[derive(Debug)]
pub struct BusPort {
    shared: Arc<BusShared>,
    id: u64,
}

impl BusPort {
    /// Returns the endpoint id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl PrimaryChannel for BusPort {
    fn post(&self, message: &ChangeMessage) -> SyncResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("local bus is closed".into()));
        }
        let payload = message.to_json()?;
        // No subscribers yet is not a failure.
        let _ = self.shared.sender.send(Frame {
            sender: self.id,
            payload: Arc::from(payload),
        });
        Ok(())
    }

    fn listen(&self) -> SyncResult<mpsc::UnboundedReceiver<ChangeMessage>> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Transport(format!("no async runtime: {e}")))?;
        let mut frames = self.shared.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let own = self.id;

        runtime.spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) if frame.sender == own => continue,
                    Ok(frame) => match ChangeMessage::from_json(&frame.payload) {
                        Ok(message) => {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed bus frame"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

/// The rung of the ladder a replica currently sends through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// The [`PrimaryChannel`].
    Broadcast,
    /// The store sentinel key.
    StorageSignal,
    /// Last-update polling only.
    Polling,
}

impl TransportMode {
    /// Returns a short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Broadcast => "broadcast",
            TransportMode::StorageSignal => "storage-signal",
            TransportMode::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ChannelInner {
    config: TransportConfig,
    keys: StorageKeys,
    role: WriterRole,
    replica_id: String,
    store: Arc<dyn KeyValueStore>,
    primary: Option<Arc<dyn PrimaryChannel>>,
    watcher: Mutex<Option<StoreWatcher>>,
    signal_available: bool,
    mode: RwLock<TransportMode>,
    poll_interval: RwLock<Duration>,
    consecutive_failures: AtomicU32,
    last_seen_update: AtomicU64,
    last_primary_seen: AtomicU64,
    handlers: ObserverRegistry<ChangeMessage>,
    mode_observers: ObserverRegistry<TransportMode>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Sends and receives [`ChangeMessage`]s over the transport ladder.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<ChannelInner>,
}

impl TransportChannel {
    /// Creates a channel. Nothing is received until [`TransportChannel::start`].
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn KeyValueStore>,
        primary: Option<Arc<dyn PrimaryChannel>>,
    ) -> Self {
        let watcher = store.watch();
        let signal_available = watcher.is_some();
        let mode = if primary.is_some() {
            TransportMode::Broadcast
        } else if signal_available {
            TransportMode::StorageSignal
        } else {
            TransportMode::Polling
        };

        Self {
            inner: Arc::new(ChannelInner {
                config: config.transport.clone(),
                keys: config.keys.clone(),
                role: config.role,
                replica_id: config.replica_id.clone(),
                store,
                primary,
                watcher: Mutex::new(watcher),
                signal_available,
                mode: RwLock::new(mode),
                poll_interval: RwLock::new(config.transport.base_poll_interval),
                consecutive_failures: AtomicU32::new(0),
                last_seen_update: AtomicU64::new(0),
                last_primary_seen: AtomicU64::new(0),
                handlers: ObserverRegistry::new(),
                mode_observers: ObserverRegistry::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Sends a message. Never fails: a failing mechanism is abandoned for the
    /// next rung of the ladder and the message is retried there.
    pub fn send(&self, message: &ChangeMessage) {
        self.inner.send(message);
    }

    /// Registers a handler for every inbound message.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeMessage) + Send + Sync + 'static,
    {
        self.inner.handlers.subscribe(handler)
    }

    /// Registers a handler called whenever the active rung changes.
    pub fn on_mode_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportMode) + Send + Sync + 'static,
    {
        self.inner.mode_observers.subscribe(handler)
    }

    /// Starts the listener, store watcher, polling and heartbeat tasks.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] when called outside a tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Transport(format!("no async runtime: {e}")))?;
        let mut tasks = Vec::new();

        if let Some(primary) = &self.inner.primary {
            match primary.listen() {
                Ok(rx) => tasks.push(runtime.spawn(listen_loop(Arc::downgrade(&self.inner), rx))),
                Err(e) => {
                    warn!(error = %e, "primary channel cannot listen; falling back");
                    self.inner.record_failure();
                    self.inner.demote(TransportMode::Broadcast);
                }
            }
        }

        if let Some(watcher) = self.inner.watcher.lock().take() {
            tasks.push(runtime.spawn(watch_loop(Arc::downgrade(&self.inner), watcher)));
        }

        tasks.push(runtime.spawn(poll_loop(Arc::downgrade(&self.inner))));
        tasks.push(runtime.spawn(heartbeat_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.heartbeat_interval,
        )));

        self.inner.tasks.lock().extend(tasks);
        debug!(
            replica = %self.inner.replica_id,
            mode = %self.mode(),
            "transport started"
        );
        Ok(())
    }

    /// Checks the last-update key once and delivers the collection if it is
    /// newer than anything seen. Returns true if a message was delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or holds malformed data.
    pub fn poll_once(&self) -> SyncResult<bool> {
        self.inner.poll_once()
    }

    /// Records a successful exchange and relaxes the polling cadence.
    pub fn record_success(&self) {
        self.inner.record_success();
    }

    /// Records a failed exchange and tightens the polling cadence.
    pub fn record_failure(&self) {
        self.inner.record_failure();
    }

    /// Abandons the primary mechanism and polls at the fastest cadence.
    pub fn force_fallback(&self) {
        if self.mode() == TransportMode::Broadcast {
            self.inner.demote(TransportMode::Broadcast);
        }
        *self.inner.poll_interval.write() = self.inner.config.min_poll_interval;
        info!(mode = %self.mode(), "forced transport fallback");
    }

    /// Tries to move back to the primary mechanism. Returns true if it is
    /// active afterwards.
    pub fn probe_primary(&self) -> bool {
        self.inner.probe_primary()
    }

    /// Returns the active rung.
    pub fn mode(&self) -> TransportMode {
        *self.inner.mode.read()
    }

    /// Returns true if the primary mechanism is the active rung.
    pub fn primary_active(&self) -> bool {
        self.mode() == TransportMode::Broadcast
    }

    /// Returns the current polling interval.
    pub fn poll_interval(&self) -> Duration {
        *self.inner.poll_interval.read()
    }

    /// Returns the number of failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Marks a last-update stamp as already known, so polling skips it.
    pub fn note_local_update(&self, stamp: u64) {
        self.inner.last_seen_update.fetch_max(stamp, Ordering::SeqCst);
    }

    /// Returns true if a primary-writer replica was seen within the
    /// liveness window. Always true on a primary writer.
    pub fn is_primary_present(&self) -> bool {
        self.inner.is_primary_present()
    }

    /// Stops every background task.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(replica = %self.inner.replica_id, "transport stopped");
    }

    /// Returns true once [`TransportChannel::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("replica", &self.inner.replica_id)
            .field("mode", &self.mode())
            .field("poll_interval", &self.poll_interval())
            .finish()
    }
}

impl ChannelInner {
    fn mode(&self) -> TransportMode {
        *self.mode.read()
    }

    fn send(&self, message: &ChangeMessage) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        // At most one attempt per rung.
        for _ in 0..3 {
            let mode = self.mode();
            match self.try_send(mode, message) {
                Ok(()) => {
                    if mode == TransportMode::Broadcast {
                        self.record_success();
                    }
                    return;
                }
                Err(e) => {
                    warn!(mode = %mode, kind = message.kind.as_str(), error = %e, "send failed; falling back");
                    self.record_failure();
                    if !self.demote(mode) {
                        return;
                    }
                }
            }
        }
    }

    fn try_send(&self, mode: TransportMode, message: &ChangeMessage) -> SyncResult<()> {
        match mode {
            TransportMode::Broadcast => match &self.primary {
                Some(primary) => primary.post(message),
                None => Err(SyncError::Transport("no primary channel".into())),
            },
            TransportMode::StorageSignal => {
                if !message.kind.carries_state() {
                    debug!(kind = message.kind.as_str(), "message not expressible as a store signal");
                    return Ok(());
                }
                self.store
                    .set(&self.keys.signal, &message.timestamp.to_string())?;
                Ok(())
            }
            // The collection and last-update key were written before sending.
            TransportMode::Polling => Ok(()),
        }
    }

    /// Moves one rung down from `from`. Returns false if there is no lower
    /// rung.
    fn demote(&self, from: TransportMode) -> bool {
        let next = match from {
            TransportMode::Broadcast if self.signal_available => TransportMode::StorageSignal,
            TransportMode::Broadcast | TransportMode::StorageSignal => TransportMode::Polling,
            TransportMode::Polling => return false,
        };
        let changed = {
            let mut mode = self.mode.write();
            if *mode == from {
                *mode = next;
                true
            } else {
                false
            }
        };
        if changed {
            info!(replica = %self.replica_id, from = %from, to = %next, "transport demoted");
            self.mode_observers.emit(&next);
        }
        true
    }

    fn probe_primary(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };
        if self.mode() == TransportMode::Broadcast {
            return true;
        }
        let ping = ChangeMessage::new(MessageType::Ping, now_ms())
            .from_role(self.role)
            .from_replica(self.replica_id.clone());
        if primary.post(&ping).is_err() {
            return false;
        }
        let changed = {
            let mut mode = self.mode.write();
            let changed = *mode != TransportMode::Broadcast;
            *mode = TransportMode::Broadcast;
            changed
        };
        if changed {
            info!(replica = %self.replica_id, "primary transport recovered");
            self.mode_observers.emit(&TransportMode::Broadcast);
        }
        self.record_success();
        true
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let interval = if self.mode() == TransportMode::Broadcast {
            self.config.healthy_interval()
        } else {
            self.config.base_poll_interval
        };
        *self.poll_interval.write() = interval;
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        let mut interval = self.poll_interval.write();
        *interval = (*interval / 2).max(self.config.min_poll_interval);
    }

    fn dispatch(&self, message: ChangeMessage) {
        if message.is_from_primary() {
            match message.kind {
                MessageType::PresenceOffline => self.last_primary_seen.store(0, Ordering::SeqCst),
                _ => {
                    self.last_primary_seen.fetch_max(now_ms(), Ordering::SeqCst);
                }
            }
        }

        match message.kind {
            MessageType::Ping => {
                if self.role == WriterRole::Primary {
                    let pong = ChangeMessage::new(MessageType::Pong, now_ms())
                        .from_role(self.role)
                        .from_replica(self.replica_id.clone());
                    self.send(&pong);
                }
            }
            MessageType::Pong => {}
            MessageType::Unknown => debug!("ignoring message of unknown type"),
            _ => self.handlers.emit(&message),
        }
    }

    fn read_last_update(&self) -> SyncResult<Option<u64>> {
        match self.store.get(&self.keys.last_update)? {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| SyncError::merge(format!("invalid last-update stamp {raw:?}: {e}"))),
            None => Ok(None),
        }
    }

    fn read_collection_message(&self, stamp: u64) -> SyncResult<Option<ChangeMessage>> {
        let Some(json) = self.store.get(&self.keys.collection)? else {
            return Ok(None);
        };
        let state = ReplicaState::from_json(&json)?;
        Ok(Some(ChangeMessage::data_update(&state, stamp)))
    }

    fn poll_once(&self) -> SyncResult<bool> {
        let Some(stamp) = self.read_last_update()? else {
            return Ok(false);
        };
        if stamp <= self.last_seen_update.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(message) = self.read_collection_message(stamp)? else {
            return Ok(false);
        };
        self.last_seen_update.fetch_max(stamp, Ordering::SeqCst);
        debug!(replica = %self.replica_id, stamp, "poll found a newer collection");
        self.dispatch(message);
        Ok(true)
    }

    fn on_signal(&self) {
        if let Err(e) = self.store.remove(&self.keys.signal) {
            debug!(error = %e, "could not clear store signal");
        }
        let result = self.read_last_update().and_then(|stamp| {
            let stamp = stamp.unwrap_or_else(now_ms);
            self.last_seen_update.fetch_max(stamp, Ordering::SeqCst);
            self.read_collection_message(stamp)
        });
        match result {
            Ok(Some(message)) => self.dispatch(message),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "store signal carried unreadable state");
                self.record_failure();
            }
        }
    }

    fn is_primary_present(&self) -> bool {
        if self.role == WriterRole::Primary {
            return true;
        }
        let window = self.config.liveness_window.as_millis() as u64;
        let now = now_ms();
        let fresh = |seen: u64| seen > 0 && now.saturating_sub(seen) <= window;

        if fresh(self.last_primary_seen.load(Ordering::SeqCst)) {
            return true;
        }
        match self.store.get(&self.keys.presence) {
            Ok(Some(raw)) => raw.trim().parse::<u64>().is_ok_and(fresh),
            Ok(None) => false,
            Err(e) => {
                debug!(error = %e, "could not read presence key");
                false
            }
        }
    }

    fn heartbeat(&self) {
        let now = now_ms();
        if self.role == WriterRole::Primary {
            if let Err(e) = self.store.set(&self.keys.presence, &now.to_string()) {
                warn!(error = %e, "could not write presence heartbeat");
            }
        } else if !self.is_primary_present() {
            let ping = ChangeMessage::new(MessageType::Ping, now)
                .from_role(self.role)
                .from_replica(self.replica_id.clone());
            self.send(&ping);
        }
        self.probe_primary();
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn listen_loop(inner: Weak<ChannelInner>, mut rx: mpsc::UnboundedReceiver<ChangeMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(message);
    }
}

async fn watch_loop(inner: Weak<ChannelInner>, mut watcher: StoreWatcher) {
    while let Some(event) = watcher.changed().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if event.key == inner.keys.signal && event.new_value.is_some() {
            inner.on_signal();
        }
    }
}

async fn poll_loop(inner: Weak<ChannelInner>) {
    loop {
        let interval = match inner.upgrade() {
            Some(inner) => *inner.poll_interval.read(),
            None => break,
        };
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = inner.poll_once() {
            warn!(error = %e, "poll failed");
            inner.record_failure();
        }
    }
}

async fn heartbeat_loop(inner: Weak<ChannelInner>, period: Duration) {
    loop {
        match inner.upgrade() {
            Some(inner) if !inner.stopped.load(Ordering::SeqCst) => inner.heartbeat(),
            _ => break,
        }
        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_protocol::{Record, UpdatedBy};
    use tabsync_storage::MemoryStore;

    struct BrokenChannel;

    impl PrimaryChannel for BrokenChannel {
        fn post(&self, _message: &ChangeMessage) -> SyncResult<()> {
            Err(SyncError::Transport("broken".into()))
        }

        fn listen(&self) -> SyncResult<mpsc::UnboundedReceiver<ChangeMessage>> {
            Err(SyncError::Transport("broken".into()))
        }
    }

    fn config(id: &str) -> EngineConfig {
        EngineConfig::with_replica_id(WriterRole::Secondary, id).with_transport(
            TransportConfig::default().with_poll_intervals(
                Duration::from_millis(20),
                Duration::from_millis(50),
                Duration::from_millis(400),
            ),
        )
    }

    fn collect(channel: &TransportChannel) -> (Subscription, mpsc::UnboundedReceiver<ChangeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = channel.on_message(move |m| {
            let _ = tx.send(m.clone());
        });
        (sub, rx)
    }

    fn sample_state() -> ReplicaState {
        ReplicaState::from_records(vec![
            Record::new(1, 10, UpdatedBy::SecondaryWriter).with_field("title", "Umbrella"),
        ])
        .unwrap()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ChangeMessage>) -> ChangeMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    #[tokio::test]
    async fn bus_does_not_echo_to_sender() {
        let bus = LocalBus::new();
        let a = bus.port();
        let b = bus.port();
        let mut from_a = a.listen().unwrap();
        let mut from_b = b.listen().unwrap();

        a.post(&ChangeMessage::new(MessageType::SyncRequest, 1)).unwrap();

        let got = recv(&mut from_b).await;
        assert_eq!(got.kind, MessageType::SyncRequest);
        assert!(tokio::time::timeout(Duration::from_millis(50), from_a.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn closed_bus_rejects_posts() {
        let bus = LocalBus::new();
        let port = bus.port();
        bus.close();
        assert!(bus.is_closed());
        assert!(port.post(&ChangeMessage::new(MessageType::Ping, 1)).is_err());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let bus = LocalBus::new();
        let port = bus.port();
        let mut rx = port.listen().unwrap();

        bus.publish_raw("{not json");
        bus.publish_raw(r#"{"type":"sync_request","timestamp":4}"#);

        assert_eq!(recv(&mut rx).await.timestamp, 4);
    }

    #[tokio::test]
    async fn broadcast_delivers_between_channels() {
        let store = MemoryStore::new();
        let bus = LocalBus::new();
        let a = TransportChannel::new(
            &config("a"),
            Arc::new(store.handle()),
            Some(Arc::new(bus.port())),
        );
        let b = TransportChannel::new(
            &config("b"),
            Arc::new(store.handle()),
            Some(Arc::new(bus.port())),
        );
        a.start().unwrap();
        b.start().unwrap();
        let (_sub, mut rx) = collect(&b);

        a.send(&ChangeMessage::data_update(&sample_state(), 5).from_replica("a"));

        let got = recv(&mut rx).await;
        assert_eq!(got.kind, MessageType::DataUpdate);
        assert_eq!(got.replica.as_deref(), Some("a"));
        assert!(a.primary_active());
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn failing_primary_falls_back_to_store_signal() {
        let store = MemoryStore::new();
        let a_store = store.handle();
        let a = TransportChannel::new(&config("a"), Arc::new(a_store.handle()), Some(Arc::new(BrokenChannel)));
        let b = TransportChannel::new(&config("b"), Arc::new(store.handle()), None);
        b.start().unwrap();
        let (_sub, mut rx) = collect(&b);

        let (_mode_sub, mut modes) = {
            let (tx, rx) = mpsc::unbounded_channel();
            (a.on_mode_change(move |m| { let _ = tx.send(*m); }), rx)
        };

        let state = sample_state();
        a_store.set("tabsync:collection", &state.to_json().unwrap()).unwrap();
        a_store.set("tabsync:last_update", "10").unwrap();
        a.send(&ChangeMessage::data_update(&state, 10));

        assert_eq!(a.mode(), TransportMode::StorageSignal);
        assert_eq!(modes.recv().await, Some(TransportMode::StorageSignal));
        assert_eq!(a.consecutive_failures(), 1);

        let got = recv(&mut rx).await;
        assert_eq!(got.kind, MessageType::DataUpdate);
        assert_eq!(got.snapshot().unwrap(), Some(state));
        b.stop();
    }

    #[tokio::test]
    async fn polling_delivers_newer_collection_once() {
        let store = MemoryStore::new();
        let channel = TransportChannel::new(&config("p"), Arc::new(store.handle()), None);
        let (_sub, mut rx) = collect(&channel);

        assert!(!channel.poll_once().unwrap());

        store.set("tabsync:collection", &sample_state().to_json().unwrap()).unwrap();
        store.set("tabsync:last_update", "42").unwrap();

        assert!(channel.poll_once().unwrap());
        assert_eq!(recv(&mut rx).await.timestamp, 42);
        assert!(!channel.poll_once().unwrap());

        channel.note_local_update(50);
        store.set("tabsync:last_update", "45").unwrap();
        assert!(!channel.poll_once().unwrap());
    }

    #[test]
    fn malformed_stamp_is_a_merge_error() {
        let store = MemoryStore::new();
        let channel = TransportChannel::new(&config("p"), Arc::new(store.handle()), None);
        store.set("tabsync:last_update", "soon").unwrap();
        assert!(matches!(channel.poll_once(), Err(SyncError::Merge(_))));
    }

    #[test]
    fn interval_adapts_to_failures() {
        let store = MemoryStore::new();
        let bus = LocalBus::new();
        let channel = TransportChannel::new(&config("i"), Arc::new(store), Some(Arc::new(bus.port())));

        channel.record_success();
        assert_eq!(channel.poll_interval(), Duration::from_millis(100));

        channel.record_failure();
        assert_eq!(channel.poll_interval(), Duration::from_millis(50));
        channel.record_failure();
        channel.record_failure();
        assert_eq!(channel.poll_interval(), Duration::from_millis(20));
        assert_eq!(channel.consecutive_failures(), 3);

        channel.force_fallback();
        assert_eq!(channel.mode(), TransportMode::StorageSignal);
        channel.record_success();
        assert_eq!(channel.poll_interval(), Duration::from_millis(50));

        assert!(channel.probe_primary());
        assert!(channel.primary_active());
    }

    #[test]
    fn ladder_without_watch_goes_to_polling() {
        struct PlainStore(MemoryStore);
        impl KeyValueStore for PlainStore {
            fn get(&self, key: &str) -> tabsync_storage::StorageResult<Option<String>> {
                self.0.get(key)
            }
            fn set(&self, key: &str, value: &str) -> tabsync_storage::StorageResult<()> {
                self.0.set(key, value)
            }
            fn remove(&self, key: &str) -> tabsync_storage::StorageResult<()> {
                self.0.remove(key)
            }
        }

        let channel = TransportChannel::new(
            &config("x"),
            Arc::new(PlainStore(MemoryStore::new())),
            Some(Arc::new(BrokenChannel)),
        );
        channel.send(&ChangeMessage::new(MessageType::SyncRequest, 1));
        assert_eq!(channel.mode(), TransportMode::Polling);
        assert!(!channel.probe_primary());
    }

    #[test]
    fn presence_follows_heartbeat_key() {
        let store = MemoryStore::new();
        let secondary = TransportChannel::new(&config("s"), Arc::new(store.handle()), None);
        assert!(!secondary.is_primary_present());

        store.set("tabsync:presence", &now_ms().to_string()).unwrap();
        assert!(secondary.is_primary_present());

        let stale = now_ms() - 60_000;
        store.set("tabsync:presence", &stale.to_string()).unwrap();
        assert!(!secondary.is_primary_present());

        let primary = TransportChannel::new(
            &EngineConfig::with_replica_id(WriterRole::Primary, "admin"),
            Arc::new(store.handle()),
            None,
        );
        assert!(primary.is_primary_present());
    }

    #[tokio::test]
    async fn primary_answers_ping_with_pong() {
        let store = MemoryStore::new();
        let bus = LocalBus::new();
        let admin = TransportChannel::new(
            &EngineConfig::with_replica_id(WriterRole::Primary, "admin"),
            Arc::new(store.handle()),
            Some(Arc::new(bus.port())),
        );
        admin.start().unwrap();

        let probe = bus.port();
        let mut replies = probe.listen().unwrap();
        probe
            .post(&ChangeMessage::new(MessageType::Ping, 1).from_role(WriterRole::Secondary))
            .unwrap();

        loop {
            let message = recv(&mut replies).await;
            if message.kind == MessageType::Pong {
                assert!(message.is_from_primary());
                break;
            }
        }
        admin.stop();
    }
}
