//! Observer registries with opaque subscription handles.
//!
//! Every component publishes its events through a [`Registry`]. Handlers run
//! in registration order, outside the registry lock, and a panicking handler
//! never prevents delivery to the handlers registered after it.

use crate::sync::lock;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

/// A registered event handler.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque handle identifying one subscription within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Live handlers keyed by subscription id.
///
/// Ids only ever grow, so key order is registration order, and removing one
/// handler leaves nothing behind.
struct Slots<T: ?Sized> {
    next: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

impl<T: ?Sized> Slots<T> {
    fn new() -> Self {
        Self {
            next: 0,
            handlers: BTreeMap::new(),
        }
    }

    fn insert(&mut self, handler: Handler<T>) -> SubscriptionId {
        let id = self.next;
        self.next += 1;
        self.handlers.insert(id, handler);
        SubscriptionId(id)
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        self.handlers.remove(&id.0).is_some()
    }

    fn snapshot(&self) -> Vec<Handler<T>> {
        self.handlers.values().cloned().collect()
    }

    fn live(&self) -> usize {
        self.handlers.len()
    }
}

/// A list of handlers for one kind of event.
///
/// Cloning a registry yields another handle to the same handler list.
pub struct Registry<T: ?Sized + 'static> {
    name: &'static str,
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: ?Sized + 'static> Registry<T> {
    /// Creates an empty registry. `name` only appears in log output.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Arc::new(Mutex::new(Slots::new())),
        }
    }

    /// Registers a handler and returns the handle that removes it again.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = lock(&self.slots).insert(Arc::new(handler));
        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    lock(&slots).remove(id);
                }
            })),
        }
    }

    /// Removes the handler registered under `id`.
    ///
    /// Returns false if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.slots).remove(id)
    }

    /// Delivers `event` to every handler in registration order.
    pub fn emit(&self, event: &T) {
        let handlers = lock(&self.slots).snapshot();
        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if let Err(payload) = outcome {
                tracing::error!(
                    registry = self.name,
                    "event handler panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        lock(&self.slots).live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized + 'static> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: ?Sized + 'static> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("handlers", &self.len())
            .finish()
    }
}

/// Handle returned by every `on_*` registration.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: SubscriptionId,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes the handler. A no-op if the registry no longer exists.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Registry<String>) {
        (Arc::new(Mutex::new(Vec::new())), Registry::new("test"))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let (log, registry) = recorder();
        for tag in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            registry.subscribe(move |event: &String| {
                log.lock().unwrap().push(format!("{}:{}", tag, event));
            });
        }

        registry.emit(&"x".to_string());

        assert_eq!(*log.lock().unwrap(), vec!["a:x", "b:x", "c:x"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let (log, registry) = recorder();
        let first = {
            let log = Arc::clone(&log);
            registry.subscribe(move |_: &String| log.lock().unwrap().push("first".into()))
        };
        {
            let log = Arc::clone(&log);
            registry.subscribe(move |_: &String| log.lock().unwrap().push("second".into()));
        }

        first.unsubscribe();
        registry.emit(&String::new());

        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_closure_registered_twice_is_two_subscriptions() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32> = Registry::new("test");
        let handler = {
            let count = Arc::clone(&count);
            move |_: &u32| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };

        let a = registry.subscribe(handler.clone());
        let b = registry.subscribe(handler);
        assert_ne!(a.id(), b.id());

        registry.emit(&1);
        a.unsubscribe();
        registry.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32> = Registry::new("test");
        registry.subscribe(|_: &u32| panic!("handler failure"));
        {
            let delivered = Arc::clone(&delivered);
            registry.subscribe(move |_: &u32| {
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.emit(&7);
        registry.emit(&8);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself_during_emit() {
        let registry: Registry<u32> = Registry::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let id = {
            let inner = registry.clone();
            let count = Arc::clone(&count);
            let slot = Arc::clone(&slot);
            registry.subscribe(move |_: &u32| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *slot.lock().unwrap() {
                    inner.unsubscribe(id);
                }
            })
        };
        *slot.lock().unwrap() = Some(id.id());

        registry.emit(&1);
        registry.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_unsubscribe_is_noop() {
        let registry: Registry<u32> = Registry::new("test");
        let sub = registry.subscribe(|_: &u32| {});
        let id = sub.id();
        sub.unsubscribe();
        assert!(!registry.unsubscribe(id));
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let registry: Registry<u32> = Registry::new("test");
        let sub = registry.subscribe(|_: &u32| {});
        drop(registry);
        sub.unsubscribe();
    }

    #[test]
    fn test_unsized_payloads() {
        let registry: Registry<[u8]> = Registry::new("binary");
        let total = Arc::new(AtomicUsize::new(0));
        {
            let total = Arc::clone(&total);
            registry.subscribe(move |bytes: &[u8]| {
                total.fetch_add(bytes.len(), Ordering::SeqCst);
            });
        }
        registry.emit(&[1u8, 2, 3][..]);
        assert_eq!(total.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_churn_behind_long_lived_handler_leaves_no_residue() {
        let registry: Registry<u32> = Registry::new("test");
        let delivered = Arc::new(AtomicUsize::new(0));
        {
            let delivered = Arc::clone(&delivered);
            registry.subscribe(move |_: &u32| {
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        }

        for _ in 0..10_000 {
            registry.subscribe(|_: &u32| {}).unsubscribe();
        }
        registry.emit(&1);

        assert_eq!(registry.len(), 1);
        assert_eq!(lock(&registry.slots).handlers.len(), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
