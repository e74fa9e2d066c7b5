//! Key-value store trait definition.

use crate::error::StorageResult;
use tokio::sync::broadcast;

/// A shared, persistent key-value store.
///
/// Stores are **opaque text stores**. They do not interpret the values they
/// hold; the engine owns the JSON layout of every key.
///
/// # Invariants
///
/// - `get` returns exactly the last value `set` for that key, from any handle
/// - `remove` of a missing key succeeds
/// - A watcher obtained from a handle never yields events caused by that
///   same handle's writes
/// - Stores must be `Send + Sync` for use from async tasks
///
/// # Implementors
///
/// - [`super::MemoryStore`] - Shared in-process store
/// - [`super::FileStore`] - Directory-backed store
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::QuotaExceeded`] if the store is full,
    /// or an I/O error.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes `key` from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be written.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Returns a watcher for writes made through other handles, if the store
    /// supports change notifications.
    fn watch(&self) -> Option<StoreWatcher> {
        None
    }
}

/// A change made to a store through some handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// The key that changed.
    pub key: String,
    /// The new value, or `None` if the key was removed.
    pub new_value: Option<String>,
    /// Identifier of the handle that made the change.
    pub origin: u64,
}

/// Receives change notifications for writes made by other handles.
#[derive(Debug)]
pub struct StoreWatcher {
    receiver: broadcast::Receiver<StoreEvent>,
    own_handle: u64,
}

impl StoreWatcher {
    /// Creates a watcher that filters out events from `own_handle`.
    pub fn new(receiver: broadcast::Receiver<StoreEvent>, own_handle: u64) -> Self {
        Self {
            receiver,
            own_handle,
        }
    }

    /// Waits for the next change made by another handle.
    ///
    /// Returns `None` once the store has been dropped. Notifications missed
    /// because the watcher lagged are skipped; the store itself still holds
    /// the latest values.
    pub async fn changed(&mut self) -> Option<StoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.origin == self.own_handle => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
