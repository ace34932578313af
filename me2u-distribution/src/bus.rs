//! Typed event bus with RAII listener handles.
//!
//! Producers (store watches, discovery sessions) own an [`EventBus`];
//! consumers get a [`Listener`] back from [`EventBus::listen`]. Dropping
//! or closing the listener detaches the callback immediately.
//!
//! Callbacks run synchronously on the emitting task. The listener set is
//! snapshotted before dispatch, so a callback may drop its own (or any
//! other) listener without deadlocking.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    listeners: Mutex<BTreeMap<u64, Callback<E>>>,
    next_id: AtomicU64,
}

impl<E> BusInner<E> {
    fn remove(&self, id: u64) -> bool {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }
}

/// Fan-out of events of type `E` to registered callbacks.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback. It stays attached while the returned handle lives.
    #[must_use = "dropping the listener detaches it immediately"]
    pub fn listen<F>(&self, callback: F) -> Listener
    where
        F: Fn(&E) + Send + Sync + 'static,
        E: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.insert(id, Arc::new(callback));

        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        let weak: Weak<dyn Detach> = weak;
        Listener {
            id,
            bus: Some(weak),
        }
    }

    /// Deliver `event` to every attached listener. Returns the number reached.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Callback<E>> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.values().cloned().collect()
        };
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .map(|l| l.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<E> Detach for BusInner<E> {
    fn detach(&self, id: u64) -> bool {
        self.remove(id)
    }
}

/// Handle to a registered callback. Detaches on drop.
pub struct Listener {
    id: u64,
    bus: Option<Weak<dyn Detach>>,
}

impl Listener {
    /// Detach now. Returns `false` if the bus was already gone.
    pub fn close(mut self) -> bool {
        self.detach()
    }

    fn detach(&mut self) -> bool {
        match self.bus.take().and_then(|weak| weak.upgrade()) {
            Some(bus) => bus.detach(self.id),
            None => false,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("attached", &self.bus.is_some())
            .finish()
    }
}
