//! Document store seam and an in-memory implementation.
//!
//! The store owns document state. Distributors only ever:
//! - `read` a snapshot,
//! - `transact` a closure that runs exclusively against one document,
//! - `watch` a document and get called with the new state after each change.
//!
//! [`MemoryStore`] serializes transactions per document with a tokio
//! mutex and emits change notifications before releasing it, so watchers
//! see changes in commit order.

use async_trait::async_trait;
use me2u_core::Document;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::bus::{EventBus, Listener};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Transaction produced no result for {0}")]
    Aborted(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Closure applied exclusively to one document.
pub type Transaction<'a> = Box<dyn FnOnce(&mut Document) + Send + 'a>;

/// Callback invoked with the committed state after every change.
pub type ChangeCallback = Box<dyn Fn(&Document) + Send + Sync>;

/// Keeps a watch attached; closing or dropping it detaches.
#[derive(Debug)]
pub struct WatchHandle {
    listener: Listener,
}

impl WatchHandle {
    pub fn new(listener: Listener) -> Self {
        Self { listener }
    }

    pub fn close(self) -> bool {
        self.listener.close()
    }
}

/// Transactional access to documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Snapshot of the document's current state.
    async fn read(&self, doc_url: &str) -> Result<Document, StoreError>;

    /// Run `tx` exclusively against the current state of `doc_url`.
    ///
    /// No two transactions on the same document interleave.
    async fn transact(&self, doc_url: &str, tx: Transaction<'_>) -> Result<(), StoreError>;

    /// Call `on_change` after every committed change to `doc_url`.
    fn watch(&self, doc_url: &str, on_change: ChangeCallback) -> Result<WatchHandle, StoreError>;
}

impl dyn DocumentStore {
    /// Typed wrapper over [`DocumentStore::transact`]: returns what `f` returns.
    pub async fn mutate<R, F>(&self, doc_url: &str, f: F) -> Result<R, StoreError>
    where
        R: Send,
        F: FnOnce(&mut Document) -> R + Send,
    {
        let mut out = None;
        {
            let slot = &mut out;
            self.transact(doc_url, Box::new(move |doc: &mut Document| *slot = Some(f(doc))))
                .await?;
        }
        out.ok_or_else(|| StoreError::Aborted(doc_url.to_owned()))
    }
}

struct DocEntry {
    state: tokio::sync::Mutex<Document>,
}

/// In-memory store used by tests, the demo gateway and embedders.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Arc<DocEntry>>>,
    /// Buses exist independently of documents so a watch may precede creation
    buses: Mutex<HashMap<String, Arc<EventBus<Document>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document, notifying watchers.
    pub async fn put(&self, doc_url: &str, doc: Document) {
        let entry = {
            let mut docs = self.docs.write().await;
            docs.entry(doc_url.to_owned())
                .or_insert_with(|| {
                    Arc::new(DocEntry {
                        state: tokio::sync::Mutex::new(Document::default()),
                    })
                })
                .clone()
        };
        let mut state = entry.state.lock().await;
        *state = doc;
        self.bus(doc_url).emit(&*state);
    }

    /// Drop a document. Existing watches stay attached; an unwatched change
    /// bus goes with the document.
    pub async fn remove(&self, doc_url: &str) -> bool {
        let removed = self.docs.write().await.remove(doc_url).is_some();
        let mut buses = self
            .buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buses.get(doc_url).is_some_and(|bus| bus.listener_count() == 0) {
            buses.remove(doc_url);
        }
        removed
    }

    pub async fn contains(&self, doc_url: &str) -> bool {
        self.docs.read().await.contains_key(doc_url)
    }

    /// Number of live watches on `doc_url`.
    pub fn watcher_count(&self, doc_url: &str) -> usize {
        self.buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(doc_url)
            .map_or(0, |bus| bus.listener_count())
    }

    fn bus(&self, doc_url: &str) -> Arc<EventBus<Document>> {
        let mut buses = self
            .buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buses
            .entry(doc_url.to_owned())
            .or_insert_with(|| Arc::new(EventBus::new()))
            .clone()
    }

    async fn entry(&self, doc_url: &str) -> Result<Arc<DocEntry>, StoreError> {
        self.docs
            .read()
            .await
            .get(doc_url)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_url.to_owned()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, doc_url: &str) -> Result<Document, StoreError> {
        let entry = self.entry(doc_url).await?;
        let state = entry.state.lock().await;
        Ok(state.clone())
    }

    async fn transact(&self, doc_url: &str, tx: Transaction<'_>) -> Result<(), StoreError> {
        let entry = self.entry(doc_url).await?;
        let mut state = entry.state.lock().await;
        let before = state.clone();
        tx(&mut *state);
        if *state != before {
            let reached = self.bus(doc_url).emit(&*state);
            log::trace!("Change on {doc_url} delivered to {reached} watchers");
        }
        Ok(())
    }

    fn watch(&self, doc_url: &str, on_change: ChangeCallback) -> Result<WatchHandle, StoreError> {
        let listener = self.bus(doc_url).listen(move |doc| on_change(doc));
        Ok(WatchHandle::new(listener))
    }
}
