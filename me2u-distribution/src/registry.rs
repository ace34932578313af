//! Distribution registry: one distributor per active document.
//!
//! ```text
//!  DocumentCollection ── active_docs() ──► register (one at a time)
//!         │
//!         └── events() ──► event loop ──┬─ DocAdded   → register
//!                                       └─ DocRemoved → retire
//!
//!  registration:  (none) ─► Starting ─► Active ─► Retiring ─► (none)
//! ```
//!
//! An entry is dropped only after its distributor finished tearing down.
//! Inconsistent collection events (a duplicate add, a remove for something
//! never registered) are reported on the error channel and logged; the
//! loop keeps going.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::distributor::{DistributionContext, DistributorError, DocumentDistributor};

/// Change in the set of active documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    DocAdded(String),
    DocRemoved(String),
}

/// Source of active documents.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    async fn active_docs(&self) -> Vec<String>;

    /// Subscribe to add/remove events from now on.
    fn events(&self) -> broadcast::Receiver<CollectionEvent>;
}

/// In-memory collection.
pub struct MemoryCollection {
    docs: RwLock<BTreeSet<String>>,
    events: broadcast::Sender<CollectionEvent>,
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` undelivered events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            docs: RwLock::new(BTreeSet::new()),
            events,
        }
    }

    /// Activate `doc_url`. Emits `DocAdded` if it was not already active.
    pub async fn add(&self, doc_url: &str) -> bool {
        let added = self.docs.write().await.insert(doc_url.to_owned());
        if added {
            self.notify(CollectionEvent::DocAdded(doc_url.to_owned()));
        }
        added
    }

    /// Retire `doc_url`. Emits `DocRemoved` if it was active.
    pub async fn remove(&self, doc_url: &str) -> bool {
        let removed = self.docs.write().await.remove(doc_url);
        if removed {
            self.notify(CollectionEvent::DocRemoved(doc_url.to_owned()));
        }
        removed
    }

    /// Emit an event without touching the active set.
    pub fn notify(&self, event: CollectionEvent) {
        // No receivers is fine: nobody is distributing yet.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn active_docs(&self) -> Vec<String> {
        self.docs.read().await.iter().cloned().collect()
    }

    fn events(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Document already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Document not registered: {0}")]
    NotRegistered(String),
    #[error("Document is starting or retiring: {0}")]
    InTransition(String),
    #[error("Failed to start distributor for {doc_url}: {source}")]
    Start {
        doc_url: String,
        #[source]
        source: DistributorError,
    },
    #[error("Teardown failed: {0}")]
    Teardown(#[source] DistributorError),
    #[error("Missed {0} collection events")]
    Lagged(u64),
}

enum Registration {
    Starting,
    Active(Arc<DocumentDistributor>),
    Retiring,
}

/// Outcome of tearing down every distributor at once.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub destroyed: usize,
    pub failures: Vec<(String, DistributorError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// `doc_url → distributor` map plus the operations that change it.
pub struct DistributionRegistry {
    ctx: DistributionContext,
    entries: RwLock<HashMap<String, Registration>>,
}

impl DistributionRegistry {
    pub fn new(ctx: DistributionContext) -> Self {
        Self {
            ctx,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Start and register a distributor for `doc_url`.
    pub async fn register(&self, doc_url: &str) -> Result<Arc<DocumentDistributor>, RegistryError> {
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(doc_url) {
                return Err(RegistryError::AlreadyRegistered(doc_url.to_owned()));
            }
            entries.insert(doc_url.to_owned(), Registration::Starting);
        }

        match DocumentDistributor::start(&self.ctx, doc_url).await {
            Ok(distributor) => {
                let distributor = Arc::new(distributor);
                self.entries.write().await.insert(
                    doc_url.to_owned(),
                    Registration::Active(distributor.clone()),
                );
                Ok(distributor)
            }
            Err(source) => {
                self.entries.write().await.remove(doc_url);
                Err(RegistryError::Start {
                    doc_url: doc_url.to_owned(),
                    source,
                })
            }
        }
    }

    /// Destroy the distributor for `doc_url`, then drop its entry.
    ///
    /// The entry is dropped even if teardown reports an error.
    pub async fn retire(&self, doc_url: &str) -> Result<(), RegistryError> {
        let distributor = {
            let mut entries = self.entries.write().await;
            let Some(registration) = entries.get_mut(doc_url) else {
                return Err(RegistryError::NotRegistered(doc_url.to_owned()));
            };
            match std::mem::replace(registration, Registration::Retiring) {
                Registration::Active(distributor) => distributor,
                other => {
                    *registration = other;
                    return Err(RegistryError::InTransition(doc_url.to_owned()));
                }
            }
        };

        let result = distributor.destroy().await;
        self.entries.write().await.remove(doc_url);
        log::info!("Retired {doc_url}");
        result.map_err(RegistryError::Teardown)
    }

    /// Apply one collection event.
    pub async fn handle_event(&self, event: CollectionEvent) -> Result<(), RegistryError> {
        match event {
            CollectionEvent::DocAdded(doc_url) => self.register(&doc_url).await.map(|_| ()),
            CollectionEvent::DocRemoved(doc_url) => self.retire(&doc_url).await,
        }
    }

    /// Bring the registry in line with `active`: register what is missing and
    /// retire what is no longer active. Entries mid-transition are left alone.
    pub async fn reconcile(&self, active: &[String]) -> Vec<RegistryError> {
        let (missing, stale) = {
            let entries = self.entries.read().await;
            let missing: Vec<String> = active
                .iter()
                .filter(|doc_url| !entries.contains_key(*doc_url))
                .cloned()
                .collect();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(doc_url, r)| {
                    matches!(r, Registration::Active(_)) && !active.contains(*doc_url)
                })
                .map(|(doc_url, _)| doc_url.clone())
                .collect();
            (missing, stale)
        };
        log::info!(
            "Reconciling: {} to register, {} to retire",
            missing.len(),
            stale.len()
        );

        let mut errors = Vec::new();
        for doc_url in &stale {
            if let Err(e) = self.retire(doc_url).await {
                errors.push(e);
            }
        }
        for doc_url in &missing {
            if let Err(e) = self.register(doc_url).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Destroy every active distributor concurrently.
    ///
    /// Each teardown runs to completion regardless of the others; failures
    /// are collected per document.
    pub async fn shutdown(&self) -> ShutdownReport {
        let active: Vec<(String, Arc<DocumentDistributor>)> = {
            let mut entries = self.entries.write().await;
            let mut active = Vec::new();
            for (doc_url, registration) in entries.iter_mut() {
                if let Registration::Active(distributor) = registration {
                    active.push((doc_url.clone(), distributor.clone()));
                    *registration = Registration::Retiring;
                }
            }
            active
        };
        log::info!("Shutting down {} distributors", active.len());

        let outcomes = join_all(active.into_iter().map(|(doc_url, distributor)| async move {
            let result = distributor.destroy().await;
            (doc_url, result)
        }))
        .await;

        let mut report = ShutdownReport::default();
        let mut entries = self.entries.write().await;
        for (doc_url, result) in outcomes {
            entries.remove(&doc_url);
            match result {
                Ok(()) => report.destroyed += 1,
                Err(e) => {
                    log::error!("Shutdown of {doc_url} failed: {e}");
                    report.failures.push((doc_url, e));
                }
            }
        }
        report
    }

    pub async fn is_registered(&self, doc_url: &str) -> bool {
        self.entries.read().await.contains_key(doc_url)
    }

    /// Documents with an active distributor, sorted.
    pub async fn active_documents(&self) -> Vec<String> {
        let mut docs: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, r)| matches!(r, Registration::Active(_)))
            .map(|(doc_url, _)| doc_url.clone())
            .collect();
        docs.sort();
        docs
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn distributor(&self, doc_url: &str) -> Option<Arc<DocumentDistributor>> {
        match self.entries.read().await.get(doc_url) {
            Some(Registration::Active(distributor)) => Some(distributor.clone()),
            _ => None,
        }
    }
}

fn report(errors: &mpsc::Sender<RegistryError>, error: RegistryError) {
    log::error!("{error}");
    if errors.try_send(error).is_err() {
        log::warn!("Registry error channel full or closed, error dropped");
    }
}

/// A running distribution: the registry plus its event loop.
pub struct Distribution {
    registry: Arc<DistributionRegistry>,
    errors: Option<mpsc::Receiver<RegistryError>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Distribution {
    pub fn registry(&self) -> &Arc<DistributionRegistry> {
        &self.registry
    }

    /// Take the receiver for registry errors (can only be called once).
    pub fn take_error_rx(&mut self) -> Option<mpsc::Receiver<RegistryError>> {
        self.errors.take()
    }

    /// Stop reacting to collection events and destroy every distributor.
    pub async fn shutdown(mut self) -> ShutdownReport {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Registry event loop ended abnormally: {e}");
            }
        }
        self.registry.shutdown().await
    }
}

/// Distribute every active document of `collection` and follow its events.
///
/// Events are subscribed to before the initial enumeration, so a document
/// added during startup is seen twice and the second add is reported as a
/// duplicate rather than missed. If the loop falls behind the collection's
/// event buffer, it reports [`RegistryError::Lagged`] and reconciles against
/// `active_docs()`.
pub async fn distribute_docs(
    collection: Arc<dyn DocumentCollection>,
    ctx: DistributionContext,
) -> Distribution {
    let (error_tx, error_rx) = mpsc::channel(ctx.config.error_channel_capacity.max(1));
    let mut events = collection.events();
    let registry = Arc::new(DistributionRegistry::new(ctx));

    for doc_url in collection.active_docs().await {
        if let Err(e) = registry.register(&doc_url).await {
            report(&error_tx, e);
        }
    }
    log::info!("Distributing {} documents", registry.len().await);

    let (stop_tx, mut stop_rx) = oneshot::channel();
    let loop_registry = registry.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        log::debug!("Collection event {event:?}");
                        if let Err(e) = loop_registry.handle_event(event).await {
                            report(&error_tx, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        report(&error_tx, RegistryError::Lagged(n));
                        // Drop the backlog and rebuild from the active set.
                        events = collection.events();
                        let active = collection.active_docs().await;
                        for e in loop_registry.reconcile(&active).await {
                            report(&error_tx, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("Registry event loop stopped");
    });

    Distribution {
        registry,
        errors: Some(error_rx),
        stop: Some(stop_tx),
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalDiscovery;
    use crate::store::MemoryStore;
    use crate::transport::LocalTransport;
    use me2u_core::Document;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        store: Arc<MemoryStore>,
        discovery: Arc<LocalDiscovery>,
        transport: Arc<LocalTransport>,
        collection: Arc<MemoryCollection>,
        ctx: DistributionContext,
    }

    async fn fixture(docs: &[&str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let collection = Arc::new(MemoryCollection::new());
        for doc in docs {
            store.put(doc, Document::new(format!("topic-{doc}"))).await;
            collection.add(doc).await;
        }
        let discovery = Arc::new(LocalDiscovery::new());
        let transport = Arc::new(LocalTransport::new());
        let ctx = DistributionContext::new(store.clone(), discovery.clone(), transport.clone());
        Fixture {
            store,
            discovery,
            transport,
            collection,
            ctx,
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(2), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_register_twice_rejected() {
        let f = fixture(&["docA"]).await;
        let registry = DistributionRegistry::new(f.ctx.clone());
        registry.register("docA").await.unwrap();
        assert!(matches!(
            registry.register("docA").await,
            Err(RegistryError::AlreadyRegistered(_))
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_entry() {
        let f = fixture(&[]).await;
        let registry = DistributionRegistry::new(f.ctx.clone());
        assert!(matches!(
            registry.register("ghost").await,
            Err(RegistryError::Start { .. })
        ));
        assert!(!registry.is_registered("ghost").await);
    }

    #[tokio::test]
    async fn test_retire_destroys_before_dropping_entry() {
        let f = fixture(&["docA"]).await;
        let registry = DistributionRegistry::new(f.ctx.clone());
        let distributor = registry.register("docA").await.unwrap();

        registry.retire("docA").await.unwrap();
        assert!(!registry.is_registered("docA").await);
        assert!(!f.transport.is_bound("annotations-docA"));
        assert!(f.discovery.session("docA").unwrap().is_destroyed());
        assert!(distributor.destroy().await.is_err());
    }

    #[tokio::test]
    async fn test_retire_unregistered() {
        let f = fixture(&[]).await;
        let registry = DistributionRegistry::new(f.ctx.clone());
        assert!(matches!(
            registry.handle_event(CollectionEvent::DocRemoved("docA".into())).await,
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_retire_with_teardown_failure_still_drops_entry() {
        let f = fixture(&["docA"]).await;
        f.discovery.fail_destroy_for("docA");
        let registry = DistributionRegistry::new(f.ctx.clone());
        registry.register("docA").await.unwrap();

        assert!(matches!(
            registry.retire("docA").await,
            Err(RegistryError::Teardown(_))
        ));
        assert!(!registry.is_registered("docA").await);
    }

    #[tokio::test]
    async fn test_distribute_startup_and_events() {
        let f = fixture(&["docA", "docB"]).await;
        let distribution = distribute_docs(f.collection.clone(), f.ctx.clone()).await;
        let registry = distribution.registry().clone();
        assert_eq!(registry.active_documents().await, vec!["docA", "docB"]);

        f.store.put("docC", Document::new("topic-docC")).await;
        f.collection.add("docC").await;
        eventually(|| {
            let registry = registry.clone();
            async move { registry.is_registered("docC").await }
        })
        .await;
        assert!(f.transport.is_bound("annotations-docC"));

        f.collection.remove("docA").await;
        eventually(|| {
            let registry = registry.clone();
            async move { !registry.is_registered("docA").await }
        })
        .await;
        assert!(!f.transport.is_bound("annotations-docA"));

        let report = distribution.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(report.destroyed, 2);
        assert_eq!(f.transport.channel_count(), 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregistered_removal_is_reported() {
        let f = fixture(&["docA"]).await;
        let mut distribution = distribute_docs(f.collection.clone(), f.ctx.clone()).await;
        let mut errors = distribution.take_error_rx().unwrap();
        assert!(distribution.take_error_rx().is_none());

        f.collection
            .notify(CollectionEvent::DocRemoved("docZ".into()));
        let error = timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, RegistryError::NotRegistered(ref d) if d == "docZ"));

        // The loop survives the inconsistency.
        assert!(distribution.registry().is_registered("docA").await);
        distribution.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_add_is_reported() {
        let f = fixture(&["docA"]).await;
        let mut distribution = distribute_docs(f.collection.clone(), f.ctx.clone()).await;
        let mut errors = distribution.take_error_rx().unwrap();

        f.collection.notify(CollectionEvent::DocAdded("docA".into()));
        let error = timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, RegistryError::AlreadyRegistered(_)));
        assert_eq!(distribution.registry().len().await, 1);
        distribution.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_isolates_failures() {
        let f = fixture(&["docA", "docB", "docC"]).await;
        f.discovery.fail_destroy_for("docB");
        let distribution = distribute_docs(f.collection.clone(), f.ctx.clone()).await;

        let report = distribution.shutdown().await;
        assert_eq!(report.destroyed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "docB");
        // docB's channel is closed even though its discovery teardown failed
        assert_eq!(f.transport.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_registers_missing_and_retires_stale() {
        let f = fixture(&["docA", "docB", "docC"]).await;
        let registry = DistributionRegistry::new(f.ctx.clone());
        registry.register("docA").await.unwrap();
        registry.register("docB").await.unwrap();

        let active = vec!["docB".to_string(), "docC".to_string(), "ghost".to_string()];
        let errors = registry.reconcile(&active).await;
        assert_eq!(registry.active_documents().await, vec!["docB", "docC"]);
        assert!(!f.transport.is_bound("annotations-docA"));
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], RegistryError::Start { doc_url, .. } if doc_url == "ghost"));
    }

    #[tokio::test]
    async fn test_lagged_events_are_reported_and_reconciled() {
        let f = fixture(&["docA"]).await;
        let collection = Arc::new(MemoryCollection::with_capacity(4));
        collection.add("docA").await;
        let mut distribution = distribute_docs(collection.clone(), f.ctx.clone()).await;
        let mut errors = distribution.take_error_rx().unwrap();

        // Far more events than the buffer holds before the loop gets to run.
        let mut expected = Vec::new();
        for n in 0..20 {
            let doc = format!("doc{n}");
            f.store.put(&doc, Document::new(format!("topic-{doc}"))).await;
            collection.add(&doc).await;
            expected.push(doc);
        }
        collection.remove("docA").await;
        expected.sort();

        let error = timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, RegistryError::Lagged(_)));

        let registry = distribution.registry().clone();
        eventually(|| {
            let registry = registry.clone();
            let expected = expected.clone();
            async move { registry.active_documents().await == expected }
        })
        .await;
        assert!(!f.transport.is_bound("annotations-docA"));

        let report = distribution.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(report.destroyed, 20);
    }
}
