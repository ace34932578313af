//! Per-peer subscription channel.
//!
//! ```text
//!            emit(payload)                    recv()
//! handler ───────────────► Subscription ─────────────► transport (peer)
//!   │                          │
//!   └── on_disconnect(guard)   └── disconnect(): Active → Disconnected,
//!                                  drops every guard exactly once
//! ```
//!
//! Guards are whatever keeps a producer attached: a store watch, a
//! discovery [`Listener`](crate::bus::Listener). Dropping them is the
//! cleanup. A guard registered after the disconnect is dropped on the spot.

use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Disconnected,
}

type Guard = Box<dyn Any + Send>;

struct Inner {
    state: SubscriptionState,
    outbox: Option<mpsc::UnboundedSender<Value>>,
    guards: Vec<Guard>,
}

/// Handler-side view of a live subscription. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    inner: Arc<Mutex<Inner>>,
}

/// Transport-side end: the stream of published payloads.
pub struct SubscriptionReceiver {
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Open a new subscription and the receiver its publishes arrive on.
    pub fn open() -> (Self, SubscriptionReceiver) {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Self {
            id,
            inner: Arc::new(Mutex::new(Inner {
                state: SubscriptionState::Active,
                outbox: Some(tx),
                guards: Vec::new(),
            })),
        };
        (sub, SubscriptionReceiver { id, rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Publish a payload. Returns `false` once disconnected.
    pub fn emit(&self, payload: Value) -> bool {
        let inner = self.lock();
        match (&inner.state, &inner.outbox) {
            (SubscriptionState::Active, Some(tx)) => {
                log::trace!("Subscription {} publish", self.id);
                tx.send(payload).is_ok()
            }
            _ => false,
        }
    }

    /// Keep `guard` alive until this subscription disconnects.
    pub fn on_disconnect<G: Any + Send>(&self, guard: G) {
        let mut inner = self.lock();
        if inner.state == SubscriptionState::Active {
            inner.guards.push(Box::new(guard));
            return;
        }
        drop(inner);
        drop(guard);
    }

    /// Transition to `Disconnected` and release every guard.
    ///
    /// Returns the number of guards released; zero on repeat calls.
    pub fn disconnect(&self) -> usize {
        let (guards, outbox) = {
            let mut inner = self.lock();
            if inner.state == SubscriptionState::Disconnected {
                return 0;
            }
            inner.state = SubscriptionState::Disconnected;
            (std::mem::take(&mut inner.guards), inner.outbox.take())
        };
        let released = guards.len();
        // Guards may run producer code on drop; keep the lock out of it.
        drop(guards);
        drop(outbox);
        log::debug!("Subscription {} disconnected ({released} guards released)", self.id);
        released
    }

    /// Guards currently held.
    pub fn guard_count(&self) -> usize {
        self.lock().guards.len()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionReceiver {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next published payload; `None` after disconnect drains.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for tests and draining.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}
