//! Channel sessions.
//!
//! A [`ChannelSession`] is one membership in one topic:
//!
//! ```text
//! idle ──join──▶ joining ──ok──▶ joined ──leave──▶ left
//!                   │  ▲            │
//!                error  └─rejoin────┘ (link drop / phx_error)
//!                   ▼
//!                errored
//! ```
//!
//! `left` and `errored` are terminal; a later join goes through the registry
//! and gets a new session.
//!
//! State lives in [`SessionShared`], owned jointly by the caller's handles
//! and by the connection task, which drives every inbound transition. Live
//! events are held back until the caller is done with the join result: the
//! [`Joined`] guard releases the session when dropped, and events that
//! arrive in between are kept in a backlog and delivered in arrival order.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use commentary_core::{
    ChannelError, ConnectionError, MsgRef, Operation, SessionId, SessionState,
};
use commentary_settings::RejoinSnapshot;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::{Command, Connection, Outbound};
use crate::dispatcher::{BindingRef, EventDispatcher, EventHandler};
use crate::protocol::{Frame, Reply};
use crate::registry::SessionMap;
use crate::tracker::{ReplyTx, RequestTracker};

/// Local event that receives the snapshot of a successful rejoin.
///
/// Lives in the reserved `phx_` namespace so it cannot collide with
/// application events.
pub const RESYNC_EVENT: &str = "phx_resync";

/// How the connection should treat a reply routed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    /// First join succeeded.
    Joined,
    /// A rejoin succeeded.
    Rejoined,
    /// The join was refused; the session is now `errored`.
    JoinFailed,
    /// A push reply was delivered.
    Resolved,
    /// Nothing was waiting on the ref.
    Unmatched,
}

/// How a stamped outbound push should be handled right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushRoute {
    /// Write it, tagged with this join ref (`None` for topics with no session).
    Send(Option<MsgRef>),
    /// Keep it queued until the session is joined again.
    Hold,
    /// The session is gone.
    Discard,
}

/// Why the connection is tearing a session down.
#[derive(Debug, Clone)]
pub(crate) enum Teardown {
    /// Local shutdown: pending work is cancelled.
    Cancelled,
    /// The link failed for good or the server closed the channel.
    Failed(ConnectionError),
}

pub(crate) struct SessionShared {
    id: SessionId,
    topic: String,
    params: Value,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    registry: Weak<SessionMap>,
}

struct SessionInner {
    state: SessionState,
    join_ref: Option<MsgRef>,
    join_waiter: Option<ReplyTx>,
    joined_once: bool,
    released: bool,
    backlog: VecDeque<(String, Value)>,
    dispatcher: EventDispatcher,
    tracker: RequestTracker,
    rejoin_attempts: u32,
}

impl SessionShared {
    pub(crate) fn new(topic: &str, params: Value, registry: Weak<SessionMap>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            id: SessionId::new(),
            topic: topic.to_owned(),
            params,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                join_ref: None,
                join_waiter: None,
                joined_once: false,
                released: false,
                backlog: VecDeque::new(),
                dispatcher: EventDispatcher::new(),
                tracker: RequestTracker::new(topic),
                rejoin_attempts: 0,
            }),
            state_tx,
            registry,
        }
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        if inner.state == next {
            return;
        }
        debug!(topic = %self.topic, from = %inner.state, to = %next, "session state");
        inner.state = next;
        let _ = self.state_tx.send_replace(next);
    }

    /// Unregister from the owning registry if it still maps the topic to us.
    fn detach(&self) {
        if let Some(map) = self.registry.upgrade() {
            let mut sessions = map.lock();
            if sessions
                .get(&self.topic)
                .is_some_and(|s| s.id() == &self.id)
            {
                let _ = sessions.remove(&self.topic);
            }
        }
    }

    // ── Connection task side ────────────────────────────────────────────

    /// Claim `join_ref` for a new join attempt and build its frame.
    ///
    /// `None` unless the session is joining with no attempt in flight.
    pub(crate) fn begin_join(&self, join_ref: MsgRef) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Joining || inner.join_ref.is_some() {
            return None;
        }
        inner.join_ref = Some(join_ref.clone());
        Some(Frame::join(join_ref, self.topic.clone(), self.params.clone()))
    }

    pub(crate) fn push_route(&self) -> PushRoute {
        let inner = self.inner.lock();
        match (inner.state, &inner.join_ref) {
            (SessionState::Joined, Some(join_ref)) => PushRoute::Send(Some(join_ref.clone())),
            (state, _) if state.is_terminal() => PushRoute::Discard,
            _ => PushRoute::Hold,
        }
    }

    pub(crate) fn mark_sent(&self, msg_ref: &MsgRef) {
        self.inner.lock().tracker.mark_sent(msg_ref);
    }

    pub(crate) fn fail_request(&self, msg_ref: &MsgRef, err: ChannelError) {
        let _ = self.inner.lock().tracker.fail(msg_ref, err);
    }

    pub(crate) fn handle_reply(&self, frame: &Frame, policy: RejoinSnapshot) -> ReplyOutcome {
        let Some(msg_ref) = frame.msg_ref.as_ref() else {
            return ReplyOutcome::Unmatched;
        };
        let Some(reply) = Reply::from_payload(&frame.payload) else {
            warn!(topic = %self.topic, %msg_ref, "malformed reply payload");
            return ReplyOutcome::Unmatched;
        };

        let mut inner = self.inner.lock();
        let is_join_reply =
            inner.state == SessionState::Joining && inner.join_ref.as_ref() == Some(msg_ref);
        if !is_join_reply {
            if inner.tracker.resolve(msg_ref, reply) {
                return ReplyOutcome::Resolved;
            }
            debug!(topic = %self.topic, %msg_ref, "reply for nothing pending (duplicate or stale)");
            return ReplyOutcome::Unmatched;
        }

        match reply.into_result() {
            Ok(response) => {
                self.transition(&mut inner, SessionState::Joined);
                inner.rejoin_attempts = 0;
                let rejoin = inner.joined_once;
                inner.joined_once = true;
                if let Some(waiter) = inner.join_waiter.take() {
                    let _ = waiter.send(Ok(response));
                    return ReplyOutcome::Joined;
                }
                if !rejoin {
                    return ReplyOutcome::Joined;
                }
                info!(topic = %self.topic, join_ref = %msg_ref, "rejoined");
                match policy {
                    RejoinSnapshot::Redeliver => {
                        let handler = inner.dispatcher.handler_for(RESYNC_EVENT);
                        drop(inner);
                        if let Some(handler) = handler {
                            handler(&response);
                        }
                    }
                    RejoinSnapshot::Suppress => {
                        debug!(topic = %self.topic, "rejoin snapshot suppressed");
                    }
                }
                ReplyOutcome::Rejoined
            }
            Err(reason) => {
                warn!(topic = %self.topic, %reason, "join refused");
                self.transition(&mut inner, SessionState::Errored);
                inner.join_ref = None;
                inner.backlog.clear();
                let err = ChannelError::Join {
                    topic: self.topic.clone(),
                    reason,
                };
                if let Some(waiter) = inner.join_waiter.take() {
                    let _ = waiter.send(Err(err.clone()));
                }
                let failed = inner.tracker.fail_all(&err);
                drop(inner);
                if failed > 0 {
                    debug!(topic = %self.topic, failed, "failed pushes after refused rejoin");
                }
                self.detach();
                ReplyOutcome::JoinFailed
            }
        }
    }

    /// Route a live event to its handler, subject to membership and gating.
    pub(crate) fn handle_event(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        if frame.join_ref.is_some() && frame.join_ref != inner.join_ref {
            debug!(topic = %self.topic, event = %frame.event, "dropping event from stale channel");
            return;
        }
        let (state, released) = (inner.state, inner.released);
        match state {
            SessionState::Joined if released => {
                let handler = inner.dispatcher.handler_for(&frame.event);
                drop(inner);
                match handler {
                    Some(handler) => handler(&frame.payload),
                    None => debug!(topic = %self.topic, event = %frame.event, "no handler, dropped"),
                }
            }
            SessionState::Joined => inner.backlog.push_back((frame.event, frame.payload)),
            _ => {
                debug!(topic = %self.topic, event = %frame.event, %state, "dropping event for inactive session");
            }
        }
    }

    /// Open the delivery gate and drain events held since the join reply.
    pub(crate) fn release(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.released = true;
            if inner.state != SessionState::Joined {
                inner.backlog.clear();
                return;
            }
            std::mem::take(&mut inner.backlog)
        };
        for (event, payload) in pending {
            let handler = {
                let inner = self.inner.lock();
                if inner.state != SessionState::Joined {
                    break;
                }
                inner.dispatcher.handler_for(&event)
            };
            if let Some(handler) = handler {
                handler(&payload);
            }
        }
    }

    /// The link dropped: fail in-flight pushes and fall back to joining.
    pub(crate) fn link_lost(&self) {
        let mut inner = self.inner.lock();
        let failed = inner.tracker.fail_sent(&ConnectionError::LinkLost);
        if matches!(inner.state, SessionState::Joined | SessionState::Joining) {
            self.transition(&mut inner, SessionState::Joining);
            inner.join_ref = None;
            inner.backlog.clear();
        }
        debug!(topic = %self.topic, failed, queued = inner.tracker.len(), "link lost");
    }

    /// The server crashed our channel. Returns the rejoin attempt number
    /// when a rejoin should be scheduled.
    pub(crate) fn server_error(&self, frame: &Frame) -> Option<u32> {
        let mut inner = self.inner.lock();
        if frame.join_ref.is_some() && frame.join_ref != inner.join_ref {
            debug!(topic = %self.topic, "ignoring phx_error from stale channel");
            return None;
        }
        if !matches!(inner.state, SessionState::Joined | SessionState::Joining) {
            return None;
        }
        warn!(topic = %self.topic, "channel errored by server");
        self.transition(&mut inner, SessionState::Joining);
        inner.join_ref = None;
        inner.backlog.clear();
        let _ = inner.tracker.fail_sent(&ConnectionError::LinkLost);
        let attempt = inner.rejoin_attempts;
        inner.rejoin_attempts = inner.rejoin_attempts.saturating_add(1);
        Some(attempt)
    }

    /// The server closed our channel. Returns whether the session ended.
    pub(crate) fn server_close(&self, frame: &Frame) -> bool {
        {
            let inner = self.inner.lock();
            if frame.join_ref.is_some() && frame.join_ref != inner.join_ref {
                debug!(topic = %self.topic, "ignoring phx_close from stale channel");
                return false;
            }
        }
        info!(topic = %self.topic, "channel closed by server");
        self.terminate(SessionState::Left, &Teardown::Failed(ConnectionError::Closed))
    }

    /// Force the session into a terminal `state`, failing everything pending.
    pub(crate) fn terminate(&self, state: SessionState, teardown: &Teardown) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        self.transition(&mut inner, state);
        inner.join_ref = None;
        inner.backlog.clear();
        let (join_err, push_err) = match teardown {
            Teardown::Cancelled => (
                self.cancelled(Operation::Join),
                self.cancelled(Operation::Push),
            ),
            Teardown::Failed(err) => (
                ChannelError::Connection(err.clone()),
                ChannelError::Connection(err.clone()),
            ),
        };
        if let Some(waiter) = inner.join_waiter.take() {
            let _ = waiter.send(Err(join_err));
        }
        let _ = inner.tracker.fail_all(&push_err);
        drop(inner);
        self.detach();
        true
    }

    fn cancelled(&self, operation: Operation) -> ChannelError {
        ChannelError::Cancelled {
            topic: self.topic.clone(),
            operation,
        }
    }

    fn invalid_state(&self, operation: Operation, state: SessionState) -> ChannelError {
        ChannelError::InvalidState {
            topic: self.topic.clone(),
            operation,
            state,
        }
    }
}

/// Handle to one channel session. Clones refer to the same session.
#[derive(Clone)]
pub struct ChannelSession {
    shared: Arc<SessionShared>,
    connection: Connection,
}

impl ChannelSession {
    pub(crate) fn new(
        connection: Connection,
        topic: &str,
        params: Value,
        registry: Weak<SessionMap>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(topic, params, registry)),
            connection,
        }
    }

    /// Unique id of this session instance.
    pub fn id(&self) -> &SessionId {
        self.shared.id()
    }

    /// Topic this session is a member of.
    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Connection the session runs on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether `other` is a handle to the same session instance.
    pub fn same_session(&self, other: &ChannelSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Register `handler` for live `event`s, replacing any earlier handler.
    ///
    /// Takes effect immediately. Events that arrive before a handler exists
    /// are dropped, not buffered.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> BindingRef {
        let handler: EventHandler = Arc::new(handler);
        self.shared.inner.lock().dispatcher.bind(event, handler)
    }

    /// Register a handler for the snapshot returned by a successful rejoin.
    pub fn on_resync(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> BindingRef {
        self.on(RESYNC_EVENT, handler)
    }

    /// Remove a binding. `false` if it was already replaced or removed.
    pub fn off(&self, binding: &BindingRef) -> bool {
        self.shared.inner.lock().dispatcher.unbind(binding)
    }

    /// Join the topic and wait for the server's answer.
    ///
    /// Valid only from `idle`. A refused join leaves the session `errored`
    /// and is not retried.
    ///
    /// Live events stay held while the returned [`Joined`] is alive, so the
    /// caller can finish handling the join reply before any handler runs.
    /// Dropping it (or calling [`Joined::start`]) delivers the events held so
    /// far in arrival order.
    pub async fn join(&self) -> Result<Joined, ChannelError> {
        let reply = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(self.shared.invalid_state(Operation::Join, inner.state));
            }
            let (tx, rx) = oneshot::channel();
            inner.join_waiter = Some(tx);
            inner.released = false;
            self.shared.transition(&mut inner, SessionState::Joining);
            rx
        };
        let gate = DeliveryGate {
            connection: self.connection.clone(),
            session: Arc::clone(&self.shared),
        };

        if let Err(err) = self
            .connection
            .submit(Command::Join(Arc::clone(&self.shared)))
        {
            let _ = self
                .shared
                .terminate(SessionState::Errored, &Teardown::Failed(err));
        }
        let reply = reply
            .await
            .unwrap_or(Err(ChannelError::Connection(ConnectionError::Closed)))?;
        Ok(Joined { reply, _gate: gate })
    }

    /// Send `event` with `payload` and wait for the server's acknowledgment.
    ///
    /// Valid only while `joined`; otherwise fails immediately and nothing is
    /// sent. A server rejection leaves the session joined.
    pub async fn push(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        let msg_ref = self.connection.next_ref();
        let reply = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Joined {
                return Err(self.shared.invalid_state(Operation::Push, inner.state));
            }
            inner.tracker.register(msg_ref.clone(), event)
        };

        let outbound = Outbound {
            topic: self.shared.topic.clone(),
            event: event.to_owned(),
            payload,
            msg_ref: msg_ref.clone(),
            origin: Some(self.shared.id.clone()),
        };
        if let Err(err) = self.connection.submit(Command::Push(outbound)) {
            self.shared.fail_request(&msg_ref, err.into());
        }
        reply
            .await
            .unwrap_or(Err(ChannelError::Connection(ConnectionError::Closed)))
    }

    /// Leave the topic.
    ///
    /// Valid from `joining` or `joined`. The session becomes `left`, is
    /// removed from the registry, and every pending request (including an
    /// unfinished join) fails as cancelled. No live event is delivered
    /// afterwards.
    pub fn leave(&self) -> Result<(), ChannelError> {
        let join_ref = {
            let mut inner = self.shared.inner.lock();
            if !matches!(inner.state, SessionState::Joining | SessionState::Joined) {
                return Err(self.shared.invalid_state(Operation::Leave, inner.state));
            }
            self.shared.transition(&mut inner, SessionState::Left);
            if let Some(waiter) = inner.join_waiter.take() {
                let _ = waiter.send(Err(self.shared.cancelled(Operation::Join)));
            }
            let cancelled = inner.tracker.cancel_all();
            inner.backlog.clear();
            debug!(topic = %self.shared.topic, cancelled, "leaving");
            inner.join_ref.take()
        };
        self.shared.detach();
        // The connection may already be gone; there is nothing to tell it then.
        let _ = self.connection.submit(Command::Leave {
            session: Arc::clone(&self.shared),
            join_ref,
        });
        Ok(())
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, handlers) = {
            let inner = self.shared.inner.lock();
            (inner.state, inner.dispatcher.len())
        };
        f.debug_struct("ChannelSession")
            .field("id", self.id())
            .field("topic", &self.topic())
            .field("state", &state)
            .field("handlers", &handlers)
            .finish_non_exhaustive()
    }
}

/// A successful join.
///
/// Holds back live events for the session until dropped. Dereferences to the
/// join reply payload.
#[must_use = "live events are delivered once this is dropped"]
pub struct Joined {
    reply: Value,
    _gate: DeliveryGate,
}

impl Joined {
    /// The join reply payload.
    pub fn reply(&self) -> &Value {
        &self.reply
    }

    /// Move the reply out, leaving `null`. Events stay held.
    pub fn take_reply(&mut self) -> Value {
        std::mem::take(&mut self.reply)
    }

    /// Start delivering live events.
    pub fn start(self) {
        drop(self);
    }
}

impl Deref for Joined {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.reply
    }
}

impl fmt::Debug for Joined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joined")
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

/// Releases live event delivery when dropped.
///
/// Created before the join is submitted so a cancelled or failed join also
/// releases.
struct DeliveryGate {
    connection: Connection,
    session: Arc<SessionShared>,
}

impl Drop for DeliveryGate {
    fn drop(&mut self) {
        if self
            .connection
            .submit(Command::Release(Arc::clone(&self.session)))
            .is_err()
        {
            self.session.release();
        }
    }
}
