//! One distributor per document.
//!
//! ```text
//!                 ┌──────────────── DocumentDistributor (doc_url) ───────────────┐
//! transport ──►   │ TransportSession "annotations-<doc_url>"                     │
//!                 │        │                                                     │
//!                 │        ▼                                                     │
//!                 │ DocumentService ── RouteTable<Handler>                       │
//!                 │        ├── AnnotationCrud ──────────► DocumentStore          │
//!                 │        └── feeds ─┬─ store watch ───► DocumentStore          │
//!                 │                   └─ listener ──────► DiscoverySession       │
//!                 └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle: `start()` is the constructing phase and yields an `Active`
//! distributor. `destroy()` moves through `Destroying` to `Destroyed`,
//! leaving the discovery topic before closing the transport channel so no
//! discovery callback runs against a closed channel.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::annotations::{AnnotationCrud, IdGenerator, UuidGenerator};
use crate::config::DistributionConfig;
use crate::discovery::{Discovery, DiscoveryError, DiscoverySession};
use crate::feeds;
use crate::protocol::{Request, Response, Verb};
use crate::routes::{Params, RouteError, RouteTable};
use crate::store::{DocumentStore, StoreError};
use crate::subscription::Subscription;
use crate::transport::{Service, Transport, TransportError, TransportSession};

/// Everything a distributor needs from the outside world.
#[derive(Clone)]
pub struct DistributionContext {
    pub store: Arc<dyn DocumentStore>,
    pub discovery: Arc<dyn Discovery>,
    pub transport: Arc<dyn Transport>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: DistributionConfig,
}

impl DistributionContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            discovery,
            transport,
            ids: Arc::new(UuidGenerator),
            config: DistributionConfig::default(),
        }
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_config(mut self, config: DistributionConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributorState {
    Active,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone, Error)]
pub enum DistributorError {
    #[error("Cannot read {doc_url}: {source}")]
    Store {
        doc_url: String,
        #[source]
        source: StoreError,
    },
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Route table error: {0}")]
    Routes(#[from] RouteError),
    #[error("Distributor for {doc_url} is {state:?}, not Active")]
    NotActive {
        doc_url: String,
        state: DistributorState,
    },
    #[error("Teardown of {doc_url} failed (discovery: {discovery:?}, transport: {transport:?})")]
    Teardown {
        doc_url: String,
        discovery: Option<DiscoveryError>,
        transport: Option<TransportError>,
    },
}

/// What a matched route does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    ListAnnotations,
    GetAnnotation,
    Related,
    CreateAnnotation,
    UpdateAnnotation,
    DeleteAnnotation,
    SubAnnotations,
    SubRelated,
}

/// The route table every document is served with.
pub fn document_routes() -> Result<RouteTable<Handler>, RouteError> {
    let mut routes = RouteTable::new();
    routes.set_handler(Verb::Get, "/annotations.jsonld", Handler::ListAnnotations)?;
    routes.set_handler(Verb::Get, "/annotations/:id.jsonld", Handler::GetAnnotation)?;
    routes.set_handler(Verb::Get, "/related.json", Handler::Related)?;
    routes.set_handler(Verb::Post, "/annotations/", Handler::CreateAnnotation)?;
    routes.set_handler(Verb::Put, "/annotations/:id.jsonld", Handler::UpdateAnnotation)?;
    routes.set_handler(Verb::Delete, "/annotations/:id.jsonld", Handler::DeleteAnnotation)?;
    routes.set_handler(Verb::Sub, "/annotations.jsonld", Handler::SubAnnotations)?;
    routes.set_handler(Verb::Sub, "/related.json", Handler::SubRelated)?;
    Ok(routes)
}

fn param<'p>(params: &'p Params, name: &str) -> &'p str {
    params.get(name).map(String::as_str).unwrap_or_default()
}

/// Request handling for one document. Bound on the transport.
pub struct DocumentService {
    doc_url: String,
    routes: RouteTable<Handler>,
    crud: AnnotationCrud,
    store: Arc<dyn DocumentStore>,
    discovery: Arc<dyn DiscoverySession>,
}

impl DocumentService {
    pub fn new(
        ctx: &DistributionContext,
        doc_url: &str,
        discovery: Arc<dyn DiscoverySession>,
    ) -> Result<Self, RouteError> {
        Ok(Self {
            doc_url: doc_url.to_owned(),
            routes: document_routes()?,
            crud: AnnotationCrud::new(
                doc_url,
                ctx.store.clone(),
                ctx.ids.clone(),
                ctx.config.jsonld_context.clone(),
            ),
            store: ctx.store.clone(),
            discovery,
        })
    }

    pub fn routes(&self) -> &RouteTable<Handler> {
        &self.routes
    }
}

#[async_trait]
impl Service for DocumentService {
    async fn call(&self, request: Request, subscription: Option<Subscription>) -> Option<Response> {
        let Some((handler, params)) = self.routes.lookup(request.verb, &request.path) else {
            log::debug!("No route for {} {} on {}", request.verb, request.path, self.doc_url);
            return None;
        };
        log::debug!("{} {} on {} → {handler:?}", request.verb, request.path, self.doc_url);

        let response = match *handler {
            Handler::ListAnnotations => self.crud.list().await,
            Handler::GetAnnotation => self.crud.get(param(&params, "id")).await,
            Handler::Related => feeds::related(self.discovery.as_ref()),
            Handler::CreateAnnotation => self.crud.create(request.body).await,
            Handler::UpdateAnnotation => self.crud.update(param(&params, "id"), request.body).await,
            Handler::DeleteAnnotation => self.crud.delete(param(&params, "id")).await,
            Handler::SubAnnotations | Handler::SubRelated => {
                let Some(subscription) = subscription else {
                    log::warn!("sub {} on {} without a subscription", request.path, self.doc_url);
                    return None;
                };
                if *handler == Handler::SubAnnotations {
                    feeds::subscribe_annotations(self.store.as_ref(), &self.doc_url, subscription)
                } else {
                    feeds::subscribe_related(&self.discovery, subscription)
                }
            }
        };
        Some(response)
    }
}

/// Serves one document until destroyed.
pub struct DocumentDistributor {
    doc_url: String,
    target: String,
    state: Mutex<DistributorState>,
    discovery: Arc<dyn DiscoverySession>,
    session: Box<dyn TransportSession>,
    service: Arc<DocumentService>,
}

impl DocumentDistributor {
    /// Join the document's topic and bind its channel.
    ///
    /// If binding fails the discovery session is torn down again before
    /// the error is returned.
    pub async fn start(ctx: &DistributionContext, doc_url: &str) -> Result<Self, DistributorError> {
        let doc = ctx
            .store
            .read(doc_url)
            .await
            .map_err(|source| DistributorError::Store {
                doc_url: doc_url.to_owned(),
                source,
            })?;

        let discovery = ctx.discovery.open(&doc.target, doc_url).await?;

        let service = match DocumentService::new(ctx, doc_url, discovery.clone()) {
            Ok(service) => Arc::new(service),
            Err(e) => {
                Self::abandon(doc_url, discovery.as_ref()).await;
                return Err(e.into());
            }
        };

        let channel = ctx.config.channel_for(doc_url);
        let session = match ctx.transport.bind(&channel, service.clone()).await {
            Ok(session) => session,
            Err(e) => {
                Self::abandon(doc_url, discovery.as_ref()).await;
                return Err(e.into());
            }
        };

        log::info!("Distributing {doc_url} on {channel} (topic {})", doc.target);
        Ok(Self {
            doc_url: doc_url.to_owned(),
            target: doc.target,
            state: Mutex::new(DistributorState::Active),
            discovery,
            session,
            service,
        })
    }

    async fn abandon(doc_url: &str, discovery: &dyn DiscoverySession) {
        if let Err(e) = discovery.destroy().await {
            log::error!("Failed to leave discovery for {doc_url} after aborted start: {e}");
        }
    }

    pub fn doc_url(&self) -> &str {
        &self.doc_url
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn channel(&self) -> &str {
        self.session.channel()
    }

    pub fn service(&self) -> &Arc<DocumentService> {
        &self.service
    }

    pub fn state(&self) -> DistributorState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: DistributorState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    /// Leave discovery, then close the channel. Both are always attempted.
    ///
    /// Only an `Active` distributor can be destroyed; later calls error.
    pub async fn destroy(&self) -> Result<(), DistributorError> {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state != DistributorState::Active {
                return Err(DistributorError::NotActive {
                    doc_url: self.doc_url.clone(),
                    state: *state,
                });
            }
            *state = DistributorState::Destroying;
        }
        log::info!("Destroying distributor for {}", self.doc_url);

        let discovery = self.discovery.destroy().await.err();
        let transport = self.session.close().await.err();
        self.set_state(DistributorState::Destroyed);

        if discovery.is_none() && transport.is_none() {
            log::info!("Distributor for {} destroyed", self.doc_url);
            return Ok(());
        }
        log::error!(
            "Distributor for {} destroyed with errors (discovery: {discovery:?}, transport: {transport:?})",
            self.doc_url
        );
        Err(DistributorError::Teardown {
            doc_url: self.doc_url.clone(),
            discovery,
            transport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalDiscovery;
    use crate::protocol::ResponseCode;
    use crate::store::MemoryStore;
    use crate::transport::LocalTransport;
    use me2u_core::Document;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        discovery: Arc<LocalDiscovery>,
        transport: Arc<LocalTransport>,
        ctx: DistributionContext,
    }

    async fn fixture(docs: &[&str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        for doc in docs {
            store.put(doc, Document::new(format!("topic-{doc}"))).await;
        }
        let discovery = Arc::new(LocalDiscovery::new());
        let transport = Arc::new(LocalTransport::new());
        let ctx = DistributionContext::new(store.clone(), discovery.clone(), transport.clone());
        Fixture {
            store,
            discovery,
            transport,
            ctx,
        }
    }

    #[test]
    fn test_route_table_shape() {
        let routes = document_routes().unwrap();
        assert_eq!(routes.len(), 8);
        let (h, params) = routes.lookup(Verb::Put, "/annotations/abc.jsonld").unwrap();
        assert_eq!(*h, Handler::UpdateAnnotation);
        assert_eq!(param(&params, "id"), "abc");
        assert_eq!(
            routes.lookup(Verb::Sub, "/related.json").map(|(h, _)| *h),
            Some(Handler::SubRelated)
        );
    }

    #[tokio::test]
    async fn test_start_binds_channel_and_joins_topic() {
        let f = fixture(&["docA"]).await;
        let distributor = DocumentDistributor::start(&f.ctx, "docA").await.unwrap();

        assert_eq!(distributor.state(), DistributorState::Active);
        assert_eq!(distributor.channel(), "annotations-docA");
        assert_eq!(distributor.target(), "topic-docA");
        assert!(f.transport.is_bound("annotations-docA"));
        assert_eq!(f.discovery.session("docA").unwrap().target(), "topic-docA");
    }

    #[tokio::test]
    async fn test_start_unknown_document() {
        let f = fixture(&[]).await;
        let result = DocumentDistributor::start(&f.ctx, "ghost").await;
        assert!(matches!(result, Err(DistributorError::Store { .. })));
        assert!(f.discovery.session("ghost").is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_discovery() {
        let f = fixture(&["docA"]).await;
        let _first = DocumentDistributor::start(&f.ctx, "docA").await.unwrap();
        let second = DocumentDistributor::start(&f.ctx, "docA").await;

        assert!(matches!(
            second,
            Err(DistributorError::Transport(TransportError::ChannelInUse(_)))
        ));
        assert!(f.discovery.session("docA").unwrap().is_destroyed());
    }

    #[tokio::test]
    async fn test_requests_flow_through_routes() {
        let f = fixture(&["docA"]).await;
        let _distributor = DocumentDistributor::start(&f.ctx, "docA").await.unwrap();
        let peer = f.transport.connect("annotations-docA").unwrap();

        let created = peer
            .request(Verb::Post, "/annotations/", Some(json!({ "text": "hi" })))
            .await
            .unwrap();
        assert_eq!(created.code, ResponseCode::Created);
        let annotation_id = created.data.as_ref().unwrap()["annotation_id"]
            .as_str()
            .unwrap()
            .to_string();

        let path = format!("/annotations/{annotation_id}.jsonld");
        let fetched = peer.request(Verb::Get, &path, None).await.unwrap();
        assert_eq!(fetched.code, ResponseCode::Ok);
        assert_eq!(fetched.data.unwrap()["text"], json!("hi"));

        let deleted = peer.request(Verb::Delete, &path, None).await.unwrap();
        assert_eq!(deleted.code, ResponseCode::Deleted);
        let again = peer.request(Verb::Delete, &path, None).await.unwrap();
        assert_eq!(again.code, ResponseCode::NotFound);

        assert!(peer.request(Verb::Get, "/nope", None).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_releases_everything() {
        let f = fixture(&["docA"]).await;
        let distributor = DocumentDistributor::start(&f.ctx, "docA").await.unwrap();
        let mut peer = f.transport.connect("annotations-docA").unwrap();
        let (_, annotations_sub, _rx1) = peer.subscribe("/annotations.jsonld").await.unwrap();
        let (_, related_sub, _rx2) = peer.subscribe("/related.json").await.unwrap();
        assert_eq!(f.store.watcher_count("docA"), 1);

        distributor.destroy().await.unwrap();
        assert_eq!(distributor.state(), DistributorState::Destroyed);

        let session = f.discovery.session("docA").unwrap();
        assert!(session.is_destroyed());
        assert!(!f.transport.is_bound("annotations-docA"));
        assert!(!annotations_sub.is_active());
        assert!(!related_sub.is_active());
        assert_eq!(f.store.watcher_count("docA"), 0);
        assert_eq!(session.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_twice_is_rejected() {
        let f = fixture(&["docA"]).await;
        let distributor = DocumentDistributor::start(&f.ctx, "docA").await.unwrap();
        distributor.destroy().await.unwrap();
        assert!(matches!(
            distributor.destroy().await,
            Err(DistributorError::NotActive {
                state: DistributorState::Destroyed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_discovery_failure_still_closes_transport() {
        let f = fixture(&["docA"]).await;
        f.discovery.fail_destroy_for("docA");
        let distributor = DocumentDistributor::start(&f.ctx, "docA").await.unwrap();

        match distributor.destroy().await {
            Err(DistributorError::Teardown {
                discovery,
                transport,
                ..
            }) => {
                assert!(discovery.is_some());
                assert!(transport.is_none());
            }
            other => panic!("expected teardown error, got {other:?}"),
        }
        assert!(!f.transport.is_bound("annotations-docA"));
        assert_eq!(distributor.state(), DistributorState::Destroyed);
    }
}
