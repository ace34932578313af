//! # me2u-distribution: Per-document annotation distribution
//!
//! Every active document gets its own request/response + pub/sub service,
//! bound on a channel named after the document and reachable by peers that
//! announce the same discovery topic.
//!
//! ## Architecture
//!
//! ```text
//! DocumentCollection ──► DistributionRegistry ──► DocumentDistributor (per doc)
//!   (added/removed)        (one per doc_url)          │
//!                                                     ├── TransportSession
//!                                                     │     └── DocumentService
//!                                                     │           ├── RouteTable
//!                                                     │           ├── AnnotationCrud ──► DocumentStore
//!                                                     │           └── feeds ───────────► Subscription
//!                                                     └── DiscoverySession
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: verbs, response codes and gateway frames (JSON)
//! - [`routes`]: path patterns and the per-document route table
//! - [`bus`]: typed event bus with RAII listener handles
//! - [`subscription`]: per-peer subscription state machine
//! - [`store`] / [`discovery`] / [`transport`]: collaborator seams plus
//!   in-memory implementations
//! - [`annotations`]: CRUD over the annotation list
//! - [`feeds`]: annotations and related-peers publish feeds
//! - [`distributor`]: per-document lifecycle
//! - [`registry`]: one distributor per active document
//! - [`server`] / [`client`]: WebSocket gateway and its client

pub mod annotations;
pub mod bus;
pub mod client;
pub mod config;
pub mod discovery;
pub mod distributor;
pub mod feeds;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod server;
pub mod store;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use annotations::{AnnotationCrud, IdGenerator, UuidGenerator};
pub use bus::{EventBus, Listener};
pub use client::{ClientError, RemoteSubscription, SwarmClient};
pub use config::{DistributionConfig, GatewayConfig};
pub use discovery::{
    Discovery, DiscoveryError, DiscoveryEvent, DiscoverySession, LocalDiscovery, LocalSession,
};
pub use distributor::{
    document_routes, DistributionContext, DistributorError, DistributorState, DocumentDistributor,
    DocumentService, Handler,
};
pub use protocol::{Frame, ProtocolError, Request, Response, ResponseCode, Verb};
pub use registry::{
    distribute_docs, CollectionEvent, Distribution, DistributionRegistry, DocumentCollection,
    MemoryCollection, RegistryError, ShutdownReport,
};
pub use routes::{Params, PathPattern, RouteError, RouteTable};
pub use server::{GatewayError, GatewayStats, SwarmServer};
pub use store::{DocumentStore, MemoryStore, StoreError, WatchHandle};
pub use subscription::{Subscription, SubscriptionReceiver, SubscriptionState};
pub use transport::{LocalTransport, PeerConnection, Service, Transport, TransportError, TransportSession};
