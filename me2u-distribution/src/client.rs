//! WebSocket client for the swarm gateway.
//!
//! Requests are multiplexed over one connection by frame id. A reader task
//! routes `response`/`unrouted` frames to the waiting caller and `publish`
//! frames to the matching [`RemoteSubscription`].

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, ProtocolError, Response, ResponseCode, Verb};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Unrouted: {0}")]
    Unrouted(String),
    #[error("Connection closed")]
    Closed,
}

enum Reply {
    Response(Response),
    Unrouted(String),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type Feeds = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A connection to a [`SwarmServer`](crate::server::SwarmServer).
pub struct SwarmClient {
    out_tx: mpsc::Sender<Frame>,
    pending: Pending,
    feeds: Feeds,
    next_id: AtomicU64,
    shutdown: oneshot::Sender<()>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SwarmClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9191`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::debug!("Connected to gateway {url}");

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let pending: Pending = Arc::default();
        let feeds: Feeds = Arc::default();
        let reader_pending = pending.clone();
        let reader_feeds = feeds.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame = match Frame::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Bad frame from gateway: {e}");
                        continue;
                    }
                };
                match frame {
                    Frame::Response { id, response } => {
                        if let Some(tx) = lock(&reader_pending).remove(&id) {
                            let _ = tx.send(Reply::Response(response));
                        }
                    }
                    Frame::Unrouted { id, reason } => {
                        if let Some(tx) = lock(&reader_pending).remove(&id) {
                            let _ = tx.send(Reply::Unrouted(reason));
                        }
                    }
                    Frame::Publish { id, data } => {
                        if let Some(tx) = lock(&reader_feeds).get(&id) {
                            let _ = tx.send(data);
                        }
                    }
                    Frame::Unsubscribe { id } => {
                        lock(&reader_feeds).remove(&id);
                    }
                    Frame::Request { id, .. } => {
                        let e = ProtocolError::UnexpectedFrame(format!("request {id} from gateway"));
                        log::warn!("{e}");
                    }
                }
            }
            // Wake every waiter with `Closed` and end every feed.
            lock(&reader_pending).clear();
            lock(&reader_feeds).clear();
            log::debug!("Gateway connection closed");
        });

        Ok(Self {
            out_tx,
            pending,
            feeds,
            next_id: AtomicU64::new(1),
            shutdown: shutdown_tx,
            reader,
            writer,
        })
    }

    async fn send_request(
        &self,
        channel: &str,
        verb: Verb,
        path: &str,
        body: Option<Value>,
        feed: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<(u64, oneshot::Receiver<Reply>), ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if let Some(feed) = feed {
            // Registered before sending: a publish may race the reply.
            lock(&self.feeds).insert(id, feed);
        }
        let frame = Frame::Request {
            id,
            channel: channel.to_owned(),
            verb,
            path: path.to_owned(),
            body,
        };
        if self.out_tx.send(frame).await.is_err() {
            lock(&self.pending).remove(&id);
            lock(&self.feeds).remove(&id);
            return Err(ClientError::Closed);
        }
        Ok((id, rx))
    }

    async fn await_reply(rx: oneshot::Receiver<Reply>) -> Result<Response, ClientError> {
        match rx.await {
            Ok(Reply::Response(response)) => Ok(response),
            Ok(Reply::Unrouted(reason)) => Err(ClientError::Unrouted(reason)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// One-shot request on `channel`.
    pub async fn request(
        &self,
        channel: &str,
        verb: Verb,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, ClientError> {
        let (_, rx) = self.send_request(channel, verb, path, body, None).await?;
        Self::await_reply(rx).await
    }

    /// Open a subscription on `channel`/`path`.
    ///
    /// The feed is returned only for a `PUB_INIT` reply; any other reply is
    /// returned with `None`.
    pub async fn subscribe(
        &self,
        channel: &str,
        path: &str,
    ) -> Result<(Response, Option<RemoteSubscription>), ClientError> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (id, rx) = self
            .send_request(channel, Verb::Sub, path, None, Some(feed_tx))
            .await?;
        let response = match Self::await_reply(rx).await {
            Ok(response) => response,
            Err(e) => {
                lock(&self.feeds).remove(&id);
                return Err(e);
            }
        };
        if response.code != ResponseCode::PubInit {
            lock(&self.feeds).remove(&id);
            return Ok((response, None));
        }
        let subscription = RemoteSubscription {
            id,
            rx: feed_rx,
            out_tx: self.out_tx.clone(),
            feeds: self.feeds.clone(),
        };
        Ok((response, Some(subscription)))
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Close the connection. Open subscriptions end.
    pub async fn close(self) {
        let Self {
            shutdown,
            reader,
            writer,
            ..
        } = self;
        let _ = shutdown.send(());
        let _ = writer.await;
        reader.abort();
    }
}

/// Client side of a gateway subscription.
pub struct RemoteSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    out_tx: mpsc::Sender<Frame>,
    feeds: Feeds,
}

impl RemoteSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next publish; `None` once the gateway ends the subscription.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Tell the gateway to drop the subscription.
    ///
    /// Waits for room in the outgoing queue. Dropping the subscription also
    /// unsubscribes, but gives up if the queue is full.
    pub async fn unsubscribe(self) -> Result<(), ClientError> {
        if lock(&self.feeds).remove(&self.id).is_none() {
            return Ok(());
        }
        self.out_tx
            .send(Frame::Unsubscribe { id: self.id })
            .await
            .map_err(|_| ClientError::Closed)
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if lock(&self.feeds).remove(&self.id).is_some()
            && self.out_tx.try_send(Frame::Unsubscribe { id: self.id }).is_err()
        {
            log::warn!("Unsubscribe {} not sent, outgoing queue full or closed", self.id);
        }
    }
}
