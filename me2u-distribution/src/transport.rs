//! Transport seam: channels, services and sessions.
//!
//! A [`Transport`] binds a [`Service`] under a channel name and hands back
//! a [`TransportSession`]; closing the session unbinds the channel and
//! disconnects every subscription opened through it.
//!
//! [`LocalTransport`] does this in-process. Peers are simulated with
//! [`LocalTransport::connect`], which is what the tests drive. The
//! WebSocket gateway in [`crate::server`] is the networked counterpart.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::protocol::{Request, Response, Verb};
use crate::subscription::{Subscription, SubscriptionReceiver};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Channel already bound: {0}")]
    ChannelInUse(String),
    #[error("No service on channel: {0}")]
    NoSuchChannel(String),
    #[error("No route for {verb} {path}")]
    Unrouted { verb: Verb, path: String },
    #[error("Session already closed: {0}")]
    Closed(String),
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Something that answers requests on a channel.
#[async_trait]
pub trait Service: Send + Sync {
    /// Handle `request`. `subscription` is set for `sub` requests.
    ///
    /// `None` means no route matched; the transport answers that itself.
    async fn call(&self, request: Request, subscription: Option<Subscription>) -> Option<Response>;
}

/// A bound channel.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn channel(&self) -> &str;

    /// Unbind and disconnect live subscriptions; resolves once closed.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Binds services to channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn bind(
        &self,
        channel: &str,
        service: Arc<dyn Service>,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// Bookkeeping shared by a channel and its session.
pub(crate) struct ChannelSlot {
    pub(crate) service: Arc<dyn Service>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ChannelSlot {
    pub(crate) fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn track(&self, subscription: &Subscription) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.retain(Subscription::is_active);
        subs.push(subscription.clone());
    }

    /// Disconnect every tracked subscription. Returns how many were live.
    pub(crate) fn disconnect_all(&self) -> usize {
        let subs = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut live = 0;
        for sub in subs.iter().filter(|s| s.is_active()) {
            sub.disconnect();
            live += 1;
        }
        live
    }

    pub(crate) fn live_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.is_active())
            .count()
    }
}

type Channels = Arc<Mutex<HashMap<String, Arc<ChannelSlot>>>>;

fn lock_channels(channels: &Channels) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChannelSlot>>> {
    channels
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process transport.
#[derive(Default, Clone)]
pub struct LocalTransport {
    channels: Channels,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, channel: &str) -> bool {
        lock_channels(&self.channels).contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        lock_channels(&self.channels).len()
    }

    /// Live subscriptions on `channel`.
    pub fn subscription_count(&self, channel: &str) -> usize {
        lock_channels(&self.channels)
            .get(channel)
            .map_or(0, |slot| slot.live_subscriptions())
    }

    /// Connect a simulated peer to `channel`.
    pub fn connect(&self, channel: &str) -> Result<PeerConnection, TransportError> {
        let slot = lock_channels(&self.channels)
            .get(channel)
            .cloned()
            .ok_or_else(|| TransportError::NoSuchChannel(channel.to_owned()))?;
        Ok(PeerConnection {
            channel: channel.to_owned(),
            slot,
            subscriptions: Vec::new(),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn bind(
        &self,
        channel: &str,
        service: Arc<dyn Service>,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut channels = lock_channels(&self.channels);
        if channels.contains_key(channel) {
            return Err(TransportError::ChannelInUse(channel.to_owned()));
        }
        let slot = Arc::new(ChannelSlot::new(service));
        channels.insert(channel.to_owned(), slot.clone());
        log::debug!("Bound local channel {channel}");
        Ok(Box::new(LocalSession {
            channel: channel.to_owned(),
            channels: self.channels.clone(),
            slot,
        }))
    }
}

struct LocalSession {
    channel: String,
    channels: Channels,
    slot: Arc<ChannelSlot>,
}

#[async_trait]
impl TransportSession for LocalSession {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn close(&self) -> Result<(), TransportError> {
        let removed = {
            let mut channels = lock_channels(&self.channels);
            match channels.get(&self.channel) {
                Some(slot) if Arc::ptr_eq(slot, &self.slot) => channels.remove(&self.channel),
                _ => None,
            }
        };
        if removed.is_none() {
            return Err(TransportError::Closed(self.channel.clone()));
        }
        let dropped = self.slot.disconnect_all();
        log::debug!("Closed local channel {} ({dropped} subscriptions dropped)", self.channel);
        Ok(())
    }
}

/// A simulated peer attached to one channel.
pub struct PeerConnection {
    channel: String,
    slot: Arc<ChannelSlot>,
    subscriptions: Vec<Subscription>,
}

impl PeerConnection {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// One-shot request.
    pub async fn request(
        &self,
        verb: Verb,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, TransportError> {
        let request = Request {
            verb,
            path: path.to_owned(),
            body,
        };
        self.slot
            .service
            .call(request, None)
            .await
            .ok_or_else(|| TransportError::Unrouted {
                verb,
                path: path.to_owned(),
            })
    }

    /// Open a subscription on `path`.
    pub async fn subscribe(
        &mut self,
        path: &str,
    ) -> Result<(Response, Subscription, SubscriptionReceiver), TransportError> {
        let (subscription, receiver) = Subscription::open();
        self.slot.track(&subscription);
        let response = self
            .slot
            .service
            .call(Request::new(Verb::Sub, path), Some(subscription.clone()))
            .await;
        match response {
            Some(response) => {
                self.subscriptions.push(subscription.clone());
                Ok((response, subscription, receiver))
            }
            None => {
                subscription.disconnect();
                Err(TransportError::Unrouted {
                    verb: Verb::Sub,
                    path: path.to_owned(),
                })
            }
        }
    }

    /// Drop the connection, disconnecting its subscriptions.
    pub fn disconnect(mut self) -> usize {
        self.disconnect_all()
    }

    fn disconnect_all(&mut self) -> usize {
        let mut live = 0;
        for sub in self.subscriptions.drain(..).filter(Subscription::is_active) {
            sub.disconnect();
            live += 1;
        }
        live
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}
