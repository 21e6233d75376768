//! In-process transport.
//!
//! [`MemoryTransport::pair`] returns the client-side transport plus a
//! [`MemoryServer`] that accepts each link the client opens as a
//! [`ServerLink`]. Tests script the server through it: read the client's
//! frames, answer them, push events, drop the link or refuse the next open.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use commentary_core::ConnectionError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tracing::warn;
use url::Url;

use super::{Link, Transport};
use crate::protocol::{Frame, ReplyStatus};

const LINK_BUFFER: usize = 64;

#[derive(Default)]
struct Shared {
    rejections: Mutex<VecDeque<ConnectionError>>,
    opened: Mutex<Vec<Url>>,
}

/// Client side of an in-process link pair.
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<ServerLink>,
    shared: Arc<Shared>,
}

/// Server side: accepts the links a [`MemoryTransport`] opens.
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerLink>,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a connected transport/server pair.
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        (
            Self {
                accept_tx,
                shared: Arc::clone(&shared),
            },
            MemoryServer { accept_rx, shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError> {
        self.shared.opened.lock().push(url.clone());
        if let Some(err) = self.shared.rejections.lock().pop_front() {
            return Err(err);
        }

        let (to_server_tx, to_server_rx) = mpsc::channel(LINK_BUFFER);
        let (to_client_tx, to_client_rx) = mpsc::channel(LINK_BUFFER);
        self.accept_tx
            .send(ServerLink {
                incoming: to_server_rx,
                outgoing: to_client_tx,
            })
            .map_err(|_| ConnectionError::Transport("memory server dropped".into()))?;

        let sink = PollSender::new(to_server_tx)
            .sink_map_err(|_| ConnectionError::Transport("memory link closed".into()));
        let stream = ReceiverStream::new(to_client_rx).map(Ok::<String, ConnectionError>);
        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

impl MemoryServer {
    /// Wait for the client to open its next link.
    pub async fn accept(&mut self) -> Option<ServerLink> {
        self.accept_rx.recv().await
    }

    /// Refuse the next open attempt with `err`. Calls queue up.
    pub fn reject_next(&self, err: ConnectionError) {
        self.shared.rejections.lock().push_back(err);
    }

    /// Every URL the client has tried to open, in order.
    pub fn opened_urls(&self) -> Vec<Url> {
        self.shared.opened.lock().clone()
    }
}

/// Server end of one open link. Dropping it closes the link.
pub struct ServerLink {
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
}

impl ServerLink {
    /// Next raw text the client wrote, or `None` once the client closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Next decodable frame the client wrote. Undecodable text is skipped.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let text = self.incoming.recv().await?;
            match Frame::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!(error = %e, "memory server skipped undecodable frame"),
            }
        }
    }

    /// Receive frames until one matches `event`, discarding the rest.
    pub async fn recv_event(&mut self, event: &str) -> Option<Frame> {
        loop {
            let frame = self.recv().await?;
            if frame.event == event {
                return Some(frame);
            }
        }
    }

    /// Write raw text to the client. `false` if the client is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(text.into()).await.is_ok()
    }

    /// Write a frame to the client. `false` if the client is gone.
    pub async fn send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text).await,
            Err(_) => false,
        }
    }

    /// Answer `request` with an `ok` reply.
    pub async fn reply_ok(&self, request: &Frame, response: Value) -> bool {
        self.send(&Frame::reply_to(request, ReplyStatus::Ok, response))
            .await
    }

    /// Answer `request` with an `error` reply.
    pub async fn reply_error(&self, request: &Frame, reason: Value) -> bool {
        self.send(&Frame::reply_to(request, ReplyStatus::Error, reason))
            .await
    }

    /// Push a server event on `topic`.
    pub async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> bool {
        self.send(&Frame::broadcast(topic, event, payload)).await
    }
}

impl std::fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLink").finish_non_exhaustive()
    }
}
