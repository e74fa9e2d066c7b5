//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;
use tabsync_protocol::{IdStrategy, WriterRole};

/// Configuration for one replica.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Replica ID (unique per engine instance).
    pub replica_id: String,
    /// Writer role of this replica.
    pub role: WriterRole,
    /// Storage key layout.
    pub keys: StorageKeys,
    /// Transport configuration.
    pub transport: TransportConfig,
    /// Retry configuration for remote calls.
    pub retry: RetryConfig,
    /// Identifier assignment strategy.
    pub id_strategy: IdStrategy,
    /// Fields every new record must set.
    pub required_fields: Vec<String>,
    /// Consecutive failures that force the degraded state.
    pub failure_threshold: u32,
    /// Maximum number of unresolved conflicts kept before the oldest is
    /// evicted.
    pub conflict_retention: usize,
    /// How long deletion tombstones are kept.
    pub tombstone_ttl: Duration,
    /// Whether a secondary replica should report `peer-unreachable` when no
    /// primary writer is alive.
    pub expect_primary: bool,
}

impl EngineConfig {
    /// Creates a configuration with a random replica ID.
    pub fn new(role: WriterRole) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self::with_replica_id(role, &uuid[..8])
    }

    /// Creates a configuration with an explicit replica ID.
    pub fn with_replica_id(role: WriterRole, replica_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            role,
            keys: StorageKeys::default(),
            transport: TransportConfig::default(),
            retry: RetryConfig::default(),
            id_strategy: IdStrategy::default(),
            required_fields: vec!["title".to_string()],
            failure_threshold: 3,
            conflict_retention: 100,
            tombstone_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            expect_primary: false,
        }
    }

    /// Sets the storage keys.
    pub fn with_keys(mut self, keys: StorageKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Sets the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the identifier strategy.
    pub fn with_id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Sets the required fields.
    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the conflict retention.
    pub fn with_conflict_retention(mut self, retention: usize) -> Self {
        self.conflict_retention = retention.max(1);
        self
    }

    /// Sets the tombstone time-to-live.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Makes a secondary replica expect a live primary writer.
    pub fn expecting_primary(mut self) -> Self {
        self.expect_primary = true;
        self
    }
}

/// Keys of the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    /// Serialized collection.
    pub collection: String,
    /// Timestamp of the last collection write.
    pub last_update: String,
    /// Heartbeat of the primary writer.
    pub presence: String,
    /// Serialized offline queue.
    pub queue: String,
    /// Last status snapshot.
    pub status: String,
    /// Sentinel used by the storage-signal transport.
    pub signal: String,
}

impl StorageKeys {
    /// Creates keys under `namespace` (e.g. `"tabsync"` gives
    /// `"tabsync:collection"`).
    pub fn with_namespace(namespace: &str) -> Self {
        Self {
            collection: format!("{namespace}:collection"),
            last_update: format!("{namespace}:last_update"),
            presence: format!("{namespace}:presence"),
            queue: format!("{namespace}:queue"),
            status: format!("{namespace}:status"),
            signal: format!("{namespace}:signal"),
        }
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::with_namespace("tabsync")
    }
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration of the transport ladder and liveness tracking.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Baseline polling interval.
    pub base_poll_interval: Duration,
    /// Floor for the polling interval.
    pub min_poll_interval: Duration,
    /// Cap for the polling interval.
    pub max_poll_interval: Duration,
    /// How long a primary-writer heartbeat stays valid.
    pub liveness_window: Duration,
    /// How often a primary writer renews its heartbeat.
    pub heartbeat_interval: Duration,
}

impl TransportConfig {
    /// Sets the polling intervals. The floor is at least one millisecond.
    pub fn with_poll_intervals(mut self, min: Duration, base: Duration, max: Duration) -> Self {
        self.min_poll_interval = min.max(MIN_INTERVAL);
        self.base_poll_interval = base.max(min);
        self.max_poll_interval = max.max(self.base_poll_interval);
        self
    }

    /// Sets the liveness window.
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Interval used while the primary mechanism is healthy.
    pub fn healthy_interval(&self) -> Duration {
        (self.base_poll_interval * 2).min(self.max_poll_interval)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_poll_interval: Duration::from_secs(2),
            min_poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(8),
            liveness_window: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Backoff schedule for calls to the remote store.
///
/// Only retryable failures (timeouts, unavailability) are retried. Once
/// `max_attempts` calls have failed the mutation is handed to the offline
/// queue instead.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Calls made before giving up, including the first one.
    pub max_attempts: u32,
    /// Pause before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single pause.
    pub max_delay: Duration,
    /// Growth factor between consecutive pauses.
    pub backoff_multiplier: f64,
    /// Stretch each pause by up to a quarter so replicas that failed
    /// together do not retry together.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// A schedule of `max_attempts` calls (at least one) starting at 100ms.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single call; the first failure goes straight to the queue.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the pause before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps every pause.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Makes pauses exact, which tests rely on.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Pause before remote call number `attempt`, counted from zero. The
    /// first call never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = grown.min(self.max_delay.as_secs_f64());

        let stretch = if self.add_jitter {
            1.0 + 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * stretch)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::with_replica_id(WriterRole::Primary, "admin")
            .with_keys(StorageKeys::with_namespace("lost-found"))
            .with_failure_threshold(0)
            .with_required_fields(["title", "location"])
            .with_id_strategy(IdStrategy::Sequential);

        assert_eq!(config.replica_id, "admin");
        assert_eq!(config.role, WriterRole::Primary);
        assert_eq!(config.keys.collection, "lost-found:collection");
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.required_fields, vec!["title", "location"]);
        assert_eq!(config.id_strategy, IdStrategy::Sequential);
    }

    #[test]
    fn random_replica_ids_differ() {
        let a = EngineConfig::new(WriterRole::Secondary);
        let b = EngineConfig::new(WriterRole::Secondary);
        assert_eq!(a.replica_id.len(), 8);
        assert_ne!(a.replica_id, b.replica_id);
    }

    #[test]
    fn default_keys() {
        let keys = StorageKeys::default();
        assert_eq!(keys.last_update, "tabsync:last_update");
        assert_eq!(keys.signal, "tabsync:signal");
    }

    #[test]
    fn healthy_interval_is_doubled_and_capped() {
        let config = TransportConfig::default();
        assert_eq!(config.healthy_interval(), Duration::from_secs(4));

        let config = TransportConfig::default().with_poll_intervals(
            Duration::from_millis(10),
            Duration::from_secs(5),
            Duration::from_secs(6),
        );
        assert_eq!(config.healthy_interval(), Duration::from_secs(6));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = TransportConfig::default()
            .with_poll_intervals(Duration::ZERO, Duration::ZERO, Duration::ZERO)
            .with_heartbeat_interval(Duration::ZERO);
        assert_eq!(config.min_poll_interval, Duration::from_millis(1));
        assert_eq!(config.base_poll_interval, Duration::from_millis(1));
        assert_eq!(config.max_poll_interval, Duration::from_millis(1));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
