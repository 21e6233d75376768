//! The shared transport connection.
//!
//! [`Connection`] is a cheap handle to a background task that owns the link.
//! The task:
//!
//! - opens the link (bounded by the connect timeout) and reopens it with
//!   backoff after every failure or drop
//! - rejoins every session that was joined when the link dropped
//! - queues pushes while the link is down and flushes them once the owning
//!   session is joined again
//! - sends heartbeats and tears down a link that stops acknowledging them
//! - decodes inbound frames and routes them to sessions, one at a time in
//!   arrival order
//!
//! Dropping the last handle (including the ones held by sessions and
//! registries) stops the task, as does [`Connection::disconnect`].

mod task;

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};

use commentary_core::{ConnectionError, LinkState, MsgRef, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::options::ConnectionOptions;
use crate::session::SessionShared;
use crate::transport::{Transport, WebSocketTransport};

use self::task::ConnectionTask;

/// Requests from handles to the connection task.
pub(crate) enum Command {
    /// Start joining a session that just moved to `joining`.
    Join(Arc<SessionShared>),
    /// Send (or queue) a push.
    Push(Outbound),
    /// The session left; forget it and tell the server.
    Leave {
        session: Arc<SessionShared>,
        join_ref: Option<MsgRef>,
    },
    /// The caller is done with the join result; deliver held-back events.
    Release(Arc<SessionShared>),
    /// Retry the join of a session the server errored.
    Rejoin(Arc<SessionShared>),
}

/// A push waiting for the link.
pub(crate) struct Outbound {
    pub(crate) topic: String,
    pub(crate) event: String,
    pub(crate) payload: Value,
    pub(crate) msg_ref: MsgRef,
    /// Session that issued it; `None` for raw [`Connection::send`]s.
    pub(crate) origin: Option<SessionId>,
}

/// Per-connection ref counter. Refs start at 1.
#[derive(Debug)]
pub(crate) struct RefCounter(AtomicU64);

impl Default for RefCounter {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl RefCounter {
    pub(crate) fn next(&self) -> MsgRef {
        MsgRef::from(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

struct ConnectionInner {
    endpoint: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    link_state: watch::Receiver<LinkState>,
    refs: Arc<RefCounter>,
    gave_up: Arc<OnceLock<ConnectionError>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a shared connection. Clones share the same link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start a connection over `transport`.
    ///
    /// Returns at once; the link opens in the background and its progress is
    /// visible through [`watch_link_state`](Self::watch_link_state). Only an
    /// endpoint that cannot be turned into a socket URL fails here. Must be
    /// called inside a Tokio runtime.
    pub fn connect(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let url = options.socket_url()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, link_state) = watch::channel(LinkState::Connecting);
        let refs = Arc::new(RefCounter::default());
        let gave_up = Arc::new(OnceLock::new());
        let shutdown = CancellationToken::new();
        let span = info_span!("connection", endpoint = %options.endpoint);
        let endpoint = options.endpoint.clone();

        let task = ConnectionTask::new(
            transport,
            options,
            url,
            cmd_rx,
            cmd_tx.downgrade(),
            state_tx,
            Arc::clone(&refs),
            Arc::clone(&gave_up),
        );
        let handle = tokio::spawn(task.run(shutdown.clone()).instrument(span));

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                cmd_tx,
                link_state,
                refs,
                gave_up,
                shutdown,
                task: Mutex::new(Some(handle)),
            }),
        })
    }

    /// [`connect`](Self::connect) over WebSocket.
    pub fn websocket(options: ConnectionOptions) -> Result<Self, ConnectionError> {
        Self::connect(Arc::new(WebSocketTransport), options)
    }

    /// Configured endpoint (without token or query).
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        *self.inner.link_state.borrow()
    }

    /// Receiver that observes every link state change.
    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.link_state.clone()
    }

    /// Send `event` with `payload` on `topic` without tracking a reply.
    ///
    /// Written immediately when the link is open, queued otherwise and
    /// flushed after the next reconnect. Frames for a topic with a session
    /// carry its current join ref.
    ///
    /// `Ok` means the frame was handed to the connection task, not that it
    /// was written. Fails with `GaveUp` once reconnecting has been abandoned
    /// and with `Closed` after shutdown. A frame that finds the outbound
    /// queue full is dropped with a warning; use
    /// [`ChannelSession::push`](crate::ChannelSession::push) when delivery
    /// must be confirmed.
    pub fn send(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<MsgRef, ConnectionError> {
        if let Some(reason) = self.inner.gave_up.get() {
            return Err(reason.clone());
        }
        let msg_ref = self.next_ref();
        self.submit(Command::Push(Outbound {
            topic: topic.to_owned(),
            event: event.to_owned(),
            payload,
            msg_ref: msg_ref.clone(),
            origin: None,
        }))?;
        Ok(msg_ref)
    }

    /// Close the link and stop the task.
    ///
    /// Every session becomes `left` and its pending requests fail as
    /// cancelled. Waits for the task to finish; later calls return at once.
    pub async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Whether [`disconnect`](Self::disconnect) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn next_ref(&self) -> MsgRef {
        self.inner.refs.next()
    }

    pub(crate) fn submit(&self, command: Command) -> Result<(), ConnectionError> {
        self.inner
            .cmd_tx
            .send(command)
            .map_err(|_| ConnectionError::Closed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("link_state", &self.link_state())
            .finish_non_exhaustive()
    }
}
