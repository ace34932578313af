//! Peer discovery seam and a local, in-process implementation.
//!
//! A discovery session tracks which peers announce the document's target
//! topic. The distributor reads the deduplicated set and listens for
//! changes; it never mutates the set itself.

use async_trait::async_trait;
use me2u_core::PeerId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::bus::{EventBus, Listener};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("Discovery session already destroyed: {0}")]
    Destroyed(String),
    #[error("Failed to join topic {topic}: {reason}")]
    Join { topic: String, reason: String },
    #[error("Failed to leave topic {topic}: {reason}")]
    Leave { topic: String, reason: String },
}

/// Announcement changes for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Announce(PeerId),
    Unannounce(PeerId),
}

/// Per-document discovery session.
#[async_trait]
pub trait DiscoverySession: Send + Sync {
    /// Peers currently announcing the topic, deduplicated.
    fn unique_announcements(&self) -> BTreeSet<PeerId>;

    /// Register for announce/unannounce events.
    fn listen(&self, callback: Box<dyn Fn(&DiscoveryEvent) + Send + Sync>) -> Listener;

    /// Leave the topic and release network resources.
    async fn destroy(&self) -> Result<(), DiscoveryError>;
}

/// Opens discovery sessions.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn open(
        &self,
        target: &str,
        doc_url: &str,
    ) -> Result<Arc<dyn DiscoverySession>, DiscoveryError>;
}

#[derive(Default)]
struct Announcements {
    /// Announce count per peer; a peer may announce over several connections
    peers: BTreeMap<PeerId, usize>,
    destroyed: bool,
}

/// In-process session for one topic.
pub struct LocalSession {
    target: String,
    doc_url: String,
    state: Mutex<Announcements>,
    events: EventBus<DiscoveryEvent>,
    fail_destroy: bool,
}

impl LocalSession {
    fn new(target: &str, doc_url: &str, fail_destroy: bool) -> Self {
        Self {
            target: target.to_owned(),
            doc_url: doc_url.to_owned(),
            state: Mutex::new(Announcements::default()),
            events: EventBus::new(),
            fail_destroy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Announcements> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn doc_url(&self) -> &str {
        &self.doc_url
    }

    /// Record an announcement from `peer` and notify listeners.
    pub fn announce(&self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            *state.peers.entry(peer.clone()).or_insert(0) += 1;
        }
        log::debug!("Peer {peer} announced {}", self.target);
        self.events.emit(&DiscoveryEvent::Announce(peer));
    }

    /// Withdraw one announcement from `peer` and notify listeners.
    pub fn unannounce(&self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            match state.peers.get_mut(&peer) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    state.peers.remove(&peer);
                }
                None => return,
            }
        }
        log::debug!("Peer {peer} unannounced {}", self.target);
        self.events.emit(&DiscoveryEvent::Unannounce(peer));
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }
}

#[async_trait]
impl DiscoverySession for LocalSession {
    fn unique_announcements(&self) -> BTreeSet<PeerId> {
        self.lock().peers.keys().cloned().collect()
    }

    fn listen(&self, callback: Box<dyn Fn(&DiscoveryEvent) + Send + Sync>) -> Listener {
        self.events.listen(move |event| callback(event))
    }

    async fn destroy(&self) -> Result<(), DiscoveryError> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(DiscoveryError::Destroyed(self.doc_url.clone()));
        }
        state.destroyed = true;
        state.peers.clear();
        if self.fail_destroy {
            return Err(DiscoveryError::Leave {
                topic: self.target.clone(),
                reason: "simulated failure".into(),
            });
        }
        log::debug!("Left discovery topic {} for {}", self.target, self.doc_url);
        Ok(())
    }
}

/// In-process discovery: sessions are kept by `doc_url` so tests and
/// embedders can drive announcements.
#[derive(Default)]
pub struct LocalDiscovery {
    sessions: Mutex<HashMap<String, Arc<LocalSession>>>,
    failing_destroy: Mutex<BTreeSet<String>>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently opened session for `doc_url`.
    pub fn session(&self, doc_url: &str) -> Option<Arc<LocalSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(doc_url)
            .cloned()
    }

    /// Make `destroy` fail for sessions opened for `doc_url` from now on.
    pub fn fail_destroy_for(&self, doc_url: &str) {
        self.failing_destroy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc_url.to_owned());
    }
}

#[async_trait]
impl Discovery for LocalDiscovery {
    async fn open(
        &self,
        target: &str,
        doc_url: &str,
    ) -> Result<Arc<dyn DiscoverySession>, DiscoveryError> {
        let fail_destroy = self
            .failing_destroy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(doc_url);
        let session = Arc::new(LocalSession::new(target, doc_url, fail_destroy));
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc_url.to_owned(), session.clone());
        log::debug!("Joined discovery topic {target} for {doc_url}");
        Ok(session)
    }
}
