//! Subscribable feeds: store changes and discovery announcements turned
//! into publishes on a [`Subscription`].
//!
//! Each feed registers exactly one producer-side listener and parks its
//! handle on the subscription, so disconnect is the only cleanup path.
//! Nothing is pushed at subscribe time; the first publish follows the
//! first change.

use me2u_core::{Document, PeerId};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crate::discovery::{DiscoveryEvent, DiscoverySession};
use crate::protocol::Response;
use crate::store::{DocumentStore, StoreError};
use crate::subscription::Subscription;

/// Plain annotation list as published on the annotations feed.
pub fn annotations_payload(doc: &Document) -> Value {
    Value::Array(doc.annotations().iter().map(|a| a.to_value()).collect())
}

pub fn announcements_payload(peers: &BTreeSet<PeerId>) -> Value {
    Value::Array(
        peers
            .iter()
            .map(|p| Value::String(p.as_str().to_owned()))
            .collect(),
    )
}

/// Publish the annotation list of `doc_url` on every store change.
pub fn subscribe_annotations(
    store: &dyn DocumentStore,
    doc_url: &str,
    subscription: Subscription,
) -> Response {
    let publisher = subscription.clone();
    let watch = store.watch(
        doc_url,
        Box::new(move |doc: &Document| {
            publisher.emit(annotations_payload(doc));
        }),
    );
    match watch {
        Ok(handle) => {
            log::debug!("Subscription {} watching {doc_url}", subscription.id());
            subscription.on_disconnect(handle);
            Response::pub_init()
        }
        Err(StoreError::NotFound(_)) => Response::not_found(),
        Err(e) => {
            log::warn!("Watch on {doc_url} failed: {e}");
            Response::error(e.to_string())
        }
    }
}

/// Publish the unique announcement set on every announce/unannounce.
pub fn subscribe_related(
    discovery: &Arc<dyn DiscoverySession>,
    subscription: Subscription,
) -> Response {
    let publisher = subscription.clone();
    // The session owns this callback; hold it weakly to avoid a cycle.
    let session: Weak<dyn DiscoverySession> = Arc::downgrade(discovery);
    let listener = discovery.listen(Box::new(move |event: &DiscoveryEvent| {
        let Some(session) = session.upgrade() else {
            return;
        };
        log::trace!("Related feed publish on {event:?}");
        publisher.emit(announcements_payload(&session.unique_announcements()));
    }));
    subscription.on_disconnect(listener);
    Response::pub_init()
}

/// One-shot read of the unique announcement set.
pub fn related(discovery: &dyn DiscoverySession) -> Response {
    Response::ok(announcements_payload(&discovery.unique_announcements()))
}
