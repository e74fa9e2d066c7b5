//! Callback registration with explicit disposal.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    handlers: RwLock<BTreeMap<u64, Handler<E>>>,
    next_id: AtomicU64,
}

/// A set of callbacks invoked for every emitted value.
///
/// Handlers run in registration order on the emitting task. The handler list
/// is copied before dispatch, so a handler may subscribe or dispose without
/// deadlocking.
pub struct ObserverRegistry<E> {
    inner: Arc<Inner<E>>,
}

impl<E> ObserverRegistry<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `handler` and returns the disposer that removes it.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
        E: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.handlers.write().insert(id, Arc::new(handler));

        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        Subscription::new(id, move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.write().remove(&id);
            }
        })
    }

    /// Calls every registered handler with `value`.
    pub fn emit(&self, value: &E) {
        let handlers: Vec<Handler<E>> = self.inner.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(value);
        }
    }

    /// Returns the number of live handlers.
    pub fn len(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every handler.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.inner.handlers.write()).len();
        if removed > 0 {
            debug!(removed, "cleared observers");
        }
    }
}

impl<E> Default for ObserverRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for ObserverRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for ObserverRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Handle returned by a registration; [`Subscription::dispose`] removes the
/// callback.
///
/// Dropping the handle without disposing keeps the callback registered for
/// the lifetime of its registry.
#[must_use = "dropping a Subscription keeps the handler registered; call dispose() to remove it"]
pub struct Subscription {
    id: u64,
    disposer: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(id: u64, disposer: F) -> Self
    where
        F: FnOnce(u64) + Send + Sync + 'static,
    {
        Self {
            id,
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Returns the registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Removes the callback. Later emits no longer reach it.
    pub fn dispose(mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn emits_to_every_handler_in_order() {
        let registry = ObserverRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = Arc::clone(&seen);
            registry.subscribe(move |v| seen.lock().push(("first", *v)))
        };
        let s2 = {
            let seen = Arc::clone(&seen);
            registry.subscribe(move |v| seen.lock().push(("second", *v)))
        };

        registry.emit(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
        assert_ne!(s1.id(), s2.id());
        s1.dispose();
        s2.dispose();
    }

    #[test]
    fn dispose_stops_delivery() {
        let registry = ObserverRegistry::<u32>::new();
        let count = Arc::new(Mutex::new(0));
        let sub = {
            let count = Arc::clone(&count);
            registry.subscribe(move |_| *count.lock() += 1)
        };

        registry.emit(&1);
        sub.dispose();
        registry.emit(&2);

        assert_eq!(*count.lock(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_after_registry_dropped_is_harmless() {
        let registry = ObserverRegistry::<u32>::new();
        let sub = registry.subscribe(|_| {});
        drop(registry);
        sub.dispose();
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let registry = ObserverRegistry::<u32>::new();
        let inner = registry.clone();
        let sub = registry.subscribe(move |_| {
            let nested = inner.subscribe(|_| {});
            nested.dispose();
        });
        registry.emit(&1);
        sub.dispose();
    }

    #[test]
    fn clear_removes_all() {
        let registry = ObserverRegistry::<u32>::new();
        let _a = registry.subscribe(|_| {});
        let _b = registry.subscribe(|_| {});
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.is_empty());
    }
}
