//! Shared in-memory key-value store.

use crate::backend::{KeyValueStore, StoreEvent, StoreWatcher};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Shared {
    entries: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StoreEvent>,
    quota: Option<usize>,
    next_handle: AtomicU64,
}

/// An in-memory store shared by every replica on a "device".
///
/// Each [`MemoryStore`] value is a *handle*. Handles created with
/// [`MemoryStore::handle`] share the same entries, and a write through one
/// handle is reported to watchers of every other handle.
///
/// This store is suitable for:
/// - Unit and integration tests
/// - Several engine instances in one process
///
/// # Example
///
/// ```rust
/// use tabsync_storage::{KeyValueStore, MemoryStore};
///
/// let tab_a = MemoryStore::new();
/// let tab_b = tab_a.handle();
/// tab_a.set("k", "v").unwrap();
/// assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("v"));
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    handle_id: u64,
}

impl MemoryStore {
    /// Creates a new empty store without a quota.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a new empty store that rejects writes beyond `quota` bytes.
    ///
    /// Usage counts key and value lengths of every entry.
    #[must_use]
    pub fn with_quota(quota: usize) -> Self {
        Self::build(Some(quota))
    }

    fn build(quota: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                events,
                quota,
                next_handle: AtomicU64::new(1),
            }),
            handle_id: 0,
        }
    }

    /// Returns a new handle onto the same shared entries.
    #[must_use]
    pub fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handle_id: self.shared.next_handle.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Returns this handle's identifier.
    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Returns the number of bytes currently held.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        usage(&self.shared.entries.read())
    }

    /// Returns all keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // No receivers is fine: nobody is watching.
        let _ = self.shared.events.send(StoreEvent {
            key: key.to_string(),
            new_value,
            origin: self.handle_id,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn usage(entries: &HashMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.shared.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        {
            let mut entries = self.shared.entries.write();
            if let Some(quota) = self.shared.quota {
                let current = usage(&entries);
                let previous = entries.get(key).map_or(0, |v| key.len() + v.len());
                let required = current - previous + key.len() + value.len();
                if required > quota {
                    return Err(StorageError::QuotaExceeded { required, quota });
                }
            }
            entries.insert(key.to_string(), value.to_string());
        }

        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let existed = self.shared.entries.write().remove(key).is_some();
        if existed {
            self.notify(key, None);
        }
        Ok(())
    }

    fn watch(&self) -> Option<StoreWatcher> {
        Some(StoreWatcher::new(
            self.shared.events.subscribe(),
            self.handle_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn memory_new_is_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.used_bytes(), 0);
        assert!(store.keys().is_empty());
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn memory_set_get_remove() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);

        // Removing again is not an error
        store.remove("a").unwrap();
    }

    #[test]
    fn memory_empty_key_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set("", "x"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn memory_handles_share_entries() {
        let first = MemoryStore::new();
        let second = first.handle();
        assert_ne!(first.handle_id(), second.handle_id());

        second.set("shared", "yes").unwrap();
        assert_eq!(first.get("shared").unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn memory_quota_enforced() {
        let store = MemoryStore::with_quota(10);
        store.set("k", "12345").unwrap();

        let err = store.set("other", "123456").unwrap_err();
        assert!(err.is_quota());

        // Replacing a value only counts the difference
        store.set("k", "123456789").unwrap();
        assert_eq!(store.used_bytes(), 10);
    }

    #[tokio::test]
    async fn memory_watch_skips_own_writes() {
        let writer = MemoryStore::new();
        let reader = writer.handle();

        let mut own = writer.watch().unwrap();
        let mut other = reader.watch().unwrap();

        writer.set("signal", "42").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), other.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "signal");
        assert_eq!(event.new_value.as_deref(), Some("42"));
        assert_eq!(event.origin, writer.handle_id());

        let own_event = tokio::time::timeout(Duration::from_millis(50), own.changed()).await;
        assert!(own_event.is_err());
    }

    #[tokio::test]
    async fn memory_watch_reports_removal() {
        let writer = MemoryStore::new();
        let reader = writer.handle();
        let mut watcher = reader.watch().unwrap();

        writer.set("gone", "1").unwrap();
        writer.remove("gone").unwrap();

        let first = watcher.changed().await.unwrap();
        assert_eq!(first.new_value.as_deref(), Some("1"));
        let second = watcher.changed().await.unwrap();
        assert_eq!(second.new_value, None);
    }
}
