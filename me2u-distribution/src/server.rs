//! WebSocket gateway: the networked [`Transport`].
//!
//! Architecture:
//! ```text
//! Peer A ──┐                      ┌── "annotations-docA" ── DocumentService
//!          ├── SwarmServer ───────┤
//! Peer B ──┘   (JSON frames)      └── "annotations-docB" ── DocumentService
//!
//! per connection:
//!   request frame ──► channel slot ──► service.call ──► response frame
//!   sub request   ──► Subscription ──► forwarder task ──► publish frames
//! ```
//!
//! Distributors bind channels through [`Transport::bind`]; peers address a
//! channel by name in every request frame. Closing a connection
//! disconnects every subscription it opened. Closing a channel session
//! disconnects every subscription opened on that channel, and the peer is
//! told with an `unsubscribe` frame.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::config::GatewayConfig;
use crate::protocol::{Frame, ProtocolError, Request, Response, ResponseCode, Verb};
use crate::subscription::Subscription;
use crate::transport::{ChannelSlot, Service, Transport, TransportError, TransportSession};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_requests: u64,
    pub unrouted_requests: u64,
    pub open_subscriptions: u64,
}

type Channels = Arc<RwLock<HashMap<String, Arc<ChannelSlot>>>>;

/// Forwarder task traffic, tagged with the [`Subscription::id`] that
/// produced it. Frame ids are chosen by the peer and may be reused.
#[derive(Debug)]
enum Outgoing {
    Publish { id: u64, sub_id: u64, data: Value },
    Ended { id: u64, sub_id: u64 },
}

/// The gateway. Cheap to clone; clones share channels and stats.
#[derive(Clone)]
pub struct SwarmServer {
    config: GatewayConfig,
    channels: Channels,
    stats: Arc<RwLock<GatewayStats>>,
}

impl SwarmServer {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            channels: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(GatewayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(GatewayConfig::default())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_bound(&self, channel: &str) -> bool {
        self.channels.read().await.contains_key(channel)
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Swarm gateway listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                server.stats.write().await.active_connections -= 1;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        // Publishes from forwarder tasks
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(self.config.outgoing_capacity.max(1));
        let mut subscriptions: HashMap<u64, Subscription> = HashMap::new();

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.write().await.total_frames += 1;
                        let reply = match Frame::decode(text.as_str()) {
                            Ok(Frame::Request { id, channel, verb, path, body }) => {
                                let request = Request { verb, path, body };
                                self.dispatch(id, &channel, request, &mut subscriptions, &out_tx).await
                            }
                            Ok(Frame::Unsubscribe { id }) => {
                                if let Some(sub) = subscriptions.remove(&id) {
                                    sub.disconnect();
                                    self.stats.write().await.open_subscriptions -= 1;
                                }
                                None
                            }
                            Ok(other) => {
                                let e = ProtocolError::UnexpectedFrame(format!("{other:?}"));
                                log::warn!("{e} from {addr}");
                                None
                            }
                            Err(e) => {
                                log::warn!("Bad frame from {addr}: {e}");
                                None
                            }
                        };
                        if let Some(frame) = reply {
                            if let Err(e) = Self::send(&mut ws_sender, &frame).await {
                                break Err(e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },
                outgoing = out_rx.recv() => {
                    // out_tx is held here, so the channel never closes
                    let Some(outgoing) = outgoing else { break Ok(()) };
                    let Some(frame) = self.settle(&mut subscriptions, outgoing).await else {
                        continue;
                    };
                    if let Err(e) = Self::send(&mut ws_sender, &frame).await {
                        break Err(e);
                    }
                }
            }
        };

        let open = subscriptions.len() as u64;
        for (_, sub) in subscriptions.drain() {
            sub.disconnect();
        }
        self.stats.write().await.open_subscriptions -= open;
        log::info!("Peer {addr} disconnected ({open} subscriptions closed)");
        result
    }

    /// Turn forwarder traffic into a frame for the peer.
    ///
    /// Traffic from a subscription that no longer owns its frame id (the
    /// peer unsubscribed, possibly reusing the id since) is dropped.
    async fn settle(
        &self,
        subscriptions: &mut HashMap<u64, Subscription>,
        outgoing: Outgoing,
    ) -> Option<Frame> {
        let (id, sub_id) = match &outgoing {
            Outgoing::Publish { id, sub_id, .. } | Outgoing::Ended { id, sub_id } => (*id, *sub_id),
        };
        if subscriptions.get(&id).map(Subscription::id) != Some(sub_id) {
            log::trace!("Dropping traffic of superseded subscription {sub_id}");
            return None;
        }
        match outgoing {
            Outgoing::Publish { id, data, .. } => Some(Frame::Publish { id, data }),
            Outgoing::Ended { id, .. } => {
                subscriptions.remove(&id);
                self.stats.write().await.open_subscriptions -= 1;
                Some(Frame::Unsubscribe { id })
            }
        }
    }

    async fn send<S>(sink: &mut S, frame: &Frame) -> Result<(), GatewayError>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let text = frame.encode()?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Route one request frame. Returns the frame to answer with.
    async fn dispatch(
        &self,
        id: u64,
        channel: &str,
        request: Request,
        subscriptions: &mut HashMap<u64, Subscription>,
        out_tx: &mpsc::Sender<Outgoing>,
    ) -> Option<Frame> {
        self.stats.write().await.total_requests += 1;
        let slot = self.channels.read().await.get(channel).cloned();
        let Some(slot) = slot else {
            self.stats.write().await.unrouted_requests += 1;
            return Some(Frame::Unrouted {
                id,
                reason: format!("no service on channel {channel}"),
            });
        };
        let verb = request.verb;
        let path = request.path.clone();

        if verb != Verb::Sub {
            return Some(match slot.service.call(request, None).await {
                Some(response) => Frame::Response { id, response },
                None => self.unrouted(id, verb, &path).await,
            });
        }

        if subscriptions.contains_key(&id) {
            return Some(Frame::Response {
                id,
                response: Response::error(format!("subscription {id} already open")),
            });
        }
        let (subscription, mut receiver) = Subscription::open();
        slot.track(&subscription);
        let Some(response) = slot.service.call(request, Some(subscription.clone())).await else {
            subscription.disconnect();
            return Some(self.unrouted(id, verb, &path).await);
        };
        if response.code != ResponseCode::PubInit {
            subscription.disconnect();
            return Some(Frame::Response { id, response });
        }

        subscriptions.insert(id, subscription);
        self.stats.write().await.open_subscriptions += 1;
        // The connection loop writes the PUB_INIT reply before it next polls
        // `out_tx`, so publishes always follow it.
        let out = out_tx.clone();
        let sub_id = receiver.id();
        tokio::spawn(async move {
            while let Some(data) = receiver.recv().await {
                if out.send(Outgoing::Publish { id, sub_id, data }).await.is_err() {
                    return;
                }
            }
            let _ = out.send(Outgoing::Ended { id, sub_id }).await;
        });
        Some(Frame::Response { id, response })
    }

    async fn unrouted(&self, id: u64, verb: Verb, path: &str) -> Frame {
        self.stats.write().await.unrouted_requests += 1;
        log::debug!("Unrouted {verb} {path}");
        Frame::Unrouted {
            id,
            reason: TransportError::Unrouted {
                verb,
                path: path.to_owned(),
            }
            .to_string(),
        }
    }
}

#[async_trait]
impl Transport for SwarmServer {
    async fn bind(
        &self,
        channel: &str,
        service: Arc<dyn Service>,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut channels = self.channels.write().await;
        if channels.contains_key(channel) {
            return Err(TransportError::ChannelInUse(channel.to_owned()));
        }
        let slot = Arc::new(ChannelSlot::new(service));
        channels.insert(channel.to_owned(), slot.clone());
        log::info!("Gateway channel {channel} bound");
        Ok(Box::new(GatewaySession {
            channel: channel.to_owned(),
            channels: self.channels.clone(),
            slot,
        }))
    }
}

struct GatewaySession {
    channel: String,
    channels: Channels,
    slot: Arc<ChannelSlot>,
}

#[async_trait]
impl TransportSession for GatewaySession {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut channels = self.channels.write().await;
            match channels.get(&self.channel) {
                Some(slot) if Arc::ptr_eq(slot, &self.slot) => {
                    channels.remove(&self.channel);
                }
                _ => return Err(TransportError::Closed(self.channel.clone())),
            }
        }
        let dropped = self.slot.disconnect_all();
        log::info!("Gateway channel {} closed ({dropped} subscriptions dropped)", self.channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    struct Fixed;

    #[async_trait]
    impl Service for Fixed {
        async fn call(&self, request: Request, _: Option<Subscription>) -> Option<Response> {
            (request.path == "/ping").then(|| Response::ok(json!("pong")))
        }
    }

    /// Accepts every subscription and keeps it.
    struct Accepting;

    #[async_trait]
    impl Service for Accepting {
        async fn call(&self, _: Request, sub: Option<Subscription>) -> Option<Response> {
            sub.map(|_| Response::pub_init())
        }
    }

    #[tokio::test]
    async fn test_bind_and_close_channel() {
        let server = SwarmServer::with_defaults();
        let session = server.bind("annotations-docA", Arc::new(Fixed)).await.unwrap();
        assert!(server.is_bound("annotations-docA").await);
        assert!(matches!(
            server.bind("annotations-docA", Arc::new(Fixed)).await,
            Err(TransportError::ChannelInUse(_))
        ));

        session.close().await.unwrap();
        assert_eq!(server.channel_count().await, 0);
        assert!(matches!(session.close().await, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_dispatch_without_channel_is_unrouted() {
        let server = SwarmServer::with_defaults();
        let (out_tx, _out_rx) = mpsc::channel(4);
        let mut subs = HashMap::new();
        let frame = server
            .dispatch(1, "nope", Request::new(Verb::Get, "/ping"), &mut subs, &out_tx)
            .await;
        assert!(matches!(frame, Some(Frame::Unrouted { id: 1, .. })));
        assert_eq!(server.stats().await.unrouted_requests, 1);
    }

    #[tokio::test]
    async fn test_dispatch_request() {
        let server = SwarmServer::with_defaults();
        let _session = server.bind("chan", Arc::new(Fixed)).await.unwrap();
        let (out_tx, _out_rx) = mpsc::channel(4);
        let mut subs = HashMap::new();
        let frame = server
            .dispatch(2, "chan", Request::new(Verb::Get, "/ping"), &mut subs, &out_tx)
            .await;
        match frame {
            Some(Frame::Response { id, response }) => {
                assert_eq!(id, 2);
                assert_eq!(response.data, Some(Value::String("pong".into())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reused_frame_id_ignores_superseded_subscription() {
        let server = SwarmServer::with_defaults();
        let _session = server.bind("chan", Arc::new(Accepting)).await.unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let mut subs = HashMap::new();
        let sub = Request::new(Verb::Sub, "/feed");

        server.dispatch(1, "chan", sub.clone(), &mut subs, &out_tx).await;
        let first = subs.remove(&1).unwrap();
        first.disconnect();
        server.stats.write().await.open_subscriptions -= 1;

        server.dispatch(1, "chan", sub, &mut subs, &out_tx).await;
        let second = subs[&1].clone();
        assert_ne!(first.id(), second.id());

        // The first forwarder reports its end under the reused id.
        let ended = timeout(Duration::from_secs(2), out_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ended, Outgoing::Ended { id: 1, sub_id } if sub_id == first.id()));
        assert!(server.settle(&mut subs, ended).await.is_none());
        assert!(second.is_active());
        assert_eq!(server.stats().await.open_subscriptions, 1);

        // Stale publishes are dropped, current ones go through.
        let stale = Outgoing::Publish { id: 1, sub_id: first.id(), data: json!(1) };
        assert!(server.settle(&mut subs, stale).await.is_none());
        second.emit(json!(2));
        let publish = timeout(Duration::from_secs(2), out_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(
            server.settle(&mut subs, publish).await,
            Some(Frame::Publish { id: 1, .. })
        ));

        second.disconnect();
        let ended = timeout(Duration::from_secs(2), out_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(
            server.settle(&mut subs, ended).await,
            Some(Frame::Unsubscribe { id: 1 })
        ));
        assert!(subs.is_empty());
        assert_eq!(server.stats().await.open_subscriptions, 0);
    }
}
