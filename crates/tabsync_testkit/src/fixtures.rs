//! Device fixtures and transport doubles.
//!
//! A [`TestDevice`] models one device: every replica started from it shares
//! the same in-memory store and the same [`LocalBus`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabsync_engine::{
    EngineConfig, LocalBus, PrimaryChannel, RetryConfig, SyncEngine, SyncError, SyncResult, TransportConfig,
};
use tabsync_protocol::{ChangeMessage, WriterRole};
use tabsync_storage::{FileStore, MemoryStore};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Poll interval bounds used by [`fast_config`].
pub const FAST_POLL_MIN: Duration = Duration::from_millis(20);
/// Base poll interval used by [`fast_config`].
pub const FAST_POLL_BASE: Duration = Duration::from_millis(50);
/// Maximum poll interval used by [`fast_config`].
pub const FAST_POLL_MAX: Duration = Duration::from_millis(200);

/// A configuration with short intervals and quick retries for tests.
pub fn fast_config(role: WriterRole, replica_id: &str) -> EngineConfig {
    EngineConfig::with_replica_id(role, replica_id)
        .with_transport(
            TransportConfig::default()
                .with_poll_intervals(FAST_POLL_MIN, FAST_POLL_BASE, FAST_POLL_MAX)
                .with_heartbeat_interval(Duration::from_millis(100))
                .with_liveness_window(Duration::from_millis(500)),
        )
        .with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .without_jitter(),
        )
}

/// Replicas sharing one in-memory store and one bus.
#[derive(Debug)]
pub struct TestDevice {
    /// The shared store.
    pub store: MemoryStore,
    /// The shared bus.
    pub bus: LocalBus,
}

impl TestDevice {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            bus: LocalBus::new(),
        }
    }

    /// Starts a replica with [`fast_config`].
    pub async fn replica(&self, role: WriterRole, replica_id: &str) -> SyncEngine {
        self.replica_with(fast_config(role, replica_id)).await
    }

    /// Starts a replica with a custom configuration.
    pub async fn replica_with(&self, config: EngineConfig) -> SyncEngine {
        SyncEngine::builder(config, Arc::new(self.store.handle()))
            .primary(self.bus.port())
            .start()
            .await
            .expect("Failed to start replica")
    }

    /// Starts a replica whose primary channel fails on every send.
    pub async fn replica_with_failing_primary(
        &self,
        role: WriterRole,
        replica_id: &str,
    ) -> (SyncEngine, Arc<FailingChannel>) {
        let channel = Arc::new(FailingChannel::new());
        let engine = SyncEngine::builder(fast_config(role, replica_id), Arc::new(self.store.handle()))
            .primary_shared(channel.clone())
            .start()
            .await
            .expect("Failed to start replica");
        (engine, channel)
    }
}

impl Default for TestDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// A file-backed store in a temporary directory, for durability tests.
pub struct TestDisk {
    /// The temporary directory (kept alive to prevent cleanup).
    dir: TempDir,
}

impl TestDisk {
    /// Creates an empty temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Opens a store over the directory. Every call sees the same data.
    pub fn store(&self) -> FileStore {
        FileStore::open(self.dir.path()).expect("Failed to open file store")
    }

    /// Starts a replica over a fresh store handle.
    pub async fn replica(&self, config: EngineConfig, online: bool) -> SyncEngine {
        SyncEngine::builder(config, Arc::new(self.store()))
            .online(online)
            .start()
            .await
            .expect("Failed to start replica")
    }
}

impl Default for TestDisk {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`PrimaryChannel`] whose sends always fail. Receiving works but never
/// yields anything unless [`FailingChannel::inject`] is used.
#[derive(Debug, Default)]
pub struct FailingChannel {
    attempts: AtomicU64,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ChangeMessage>>>,
}

impl FailingChannel {
    /// Creates the channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many sends were attempted.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Delivers a message to every listener.
    pub fn inject(&self, message: ChangeMessage) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }
}

impl PrimaryChannel for FailingChannel {
    fn post(&self, _message: &ChangeMessage) -> SyncResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::Transport("channel is broken".into()))
    }

    fn listen(&self) -> SyncResult<mpsc::UnboundedReceiver<ChangeMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        Ok(rx)
    }
}

/// Waits until `check` holds, polling every 10ms for at most `timeout`.
///
/// Returns false on timeout.
pub async fn wait_until<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Installs a test tracing subscriber once. Later calls do nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
