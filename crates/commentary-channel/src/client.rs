//! Typed comment-thread API over channel sessions.
//!
//! [`CommentClient::open_topic`] is the entry point for views: it finds or
//! creates the topic's session, joins it, and hands back an [`OpenedTopic`]
//! with the initial [`Snapshot`] and a [`CommentThread`] for posting comments
//! and following new ones. New comments reach handlers only once the
//! [`OpenedTopic`] is started or dropped.

use commentary_core::comment::{ADD_COMMENT_EVENT, channel_topic, new_comment_event};
use commentary_core::{
    AddComment, ChannelError, Comment, ConnectionError, NewComment, Operation, SessionState,
    Snapshot,
};
use serde_json::Value;
use tracing::warn;

use crate::connection::Connection;
use crate::dispatcher::BindingRef;
use crate::options::ConnectionOptions;
use crate::registry::SubscriptionRegistry;
use crate::session::{ChannelSession, Joined};

/// Opens comment threads on a shared connection.
#[derive(Clone, Debug)]
pub struct CommentClient {
    registry: SubscriptionRegistry,
}

impl CommentClient {
    /// Client using a fresh registry on `connection`.
    pub fn new(connection: Connection) -> Self {
        Self::with_registry(SubscriptionRegistry::new(connection))
    }

    /// Client sharing an existing registry.
    pub fn with_registry(registry: SubscriptionRegistry) -> Self {
        Self { registry }
    }

    /// Connect over WebSocket with `options`.
    pub fn connect(options: ConnectionOptions) -> Result<Self, ConnectionError> {
        Connection::websocket(options).map(Self::new)
    }

    /// The session registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        self.registry.connection()
    }

    /// Comment thread for `topic_id`, not joined yet.
    ///
    /// Bind handlers on it, then [`join`](CommentThread::join). Fails with
    /// `InvalidState` when the topic is already open through another handle;
    /// reuse that [`CommentThread`] instead.
    pub fn thread(&self, topic_id: &str) -> Result<CommentThread, ChannelError> {
        let topic = channel_topic(topic_id);
        let session = self.registry.get_or_create(&topic);
        let state = session.state();
        if state != SessionState::Idle {
            return Err(ChannelError::InvalidState {
                topic,
                operation: Operation::Join,
                state,
            });
        }
        Ok(CommentThread {
            topic_id: topic_id.to_owned(),
            session,
        })
    }

    /// Join the comment thread for `topic_id`.
    pub async fn open_topic(&self, topic_id: &str) -> Result<OpenedTopic, ChannelError> {
        self.thread(topic_id)?.join().await
    }

    /// Like [`open_topic`](Self::open_topic), with `on_new_comment`
    /// registered before the join so no comment after the snapshot is
    /// missed.
    pub async fn open_topic_with(
        &self,
        topic_id: &str,
        on_new_comment: impl Fn(Comment) + Send + Sync + 'static,
    ) -> Result<OpenedTopic, ChannelError> {
        let thread = self.thread(topic_id)?;
        let _ = thread.on_new_comment(on_new_comment);
        thread.join().await
    }
}

/// A freshly joined thread and its initial snapshot.
///
/// New comments are held back until this is dropped or
/// [`start`](Self::start)ed, so render the snapshot first.
#[derive(Debug)]
#[must_use = "new comments are delivered once this is dropped"]
pub struct OpenedTopic {
    snapshot: Snapshot,
    thread: CommentThread,
    _joined: Joined,
}

impl OpenedTopic {
    /// Comments present at join time.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Move the snapshot out, leaving it empty. New comments stay held.
    pub fn take_snapshot(&mut self) -> Snapshot {
        std::mem::take(&mut self.snapshot)
    }

    /// The joined thread.
    pub fn thread(&self) -> &CommentThread {
        &self.thread
    }

    /// Start delivering new comments and keep the thread.
    pub fn start(self) -> CommentThread {
        self.thread
    }
}

/// A comment thread on one topic.
#[derive(Clone, Debug)]
pub struct CommentThread {
    topic_id: String,
    session: ChannelSession,
}

impl CommentThread {
    /// Topic id, e.g. `42`.
    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// The underlying channel session.
    pub fn session(&self) -> &ChannelSession {
        &self.session
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Join the thread and parse its snapshot.
    ///
    /// A reply that is not a snapshot leaves the topic again and fails with
    /// `Protocol`.
    pub async fn join(&self) -> Result<OpenedTopic, ChannelError> {
        let mut joined = self.session.join().await?;
        match serde_json::from_value::<Snapshot>(joined.take_reply()) {
            Ok(snapshot) => Ok(OpenedTopic {
                snapshot,
                thread: self.clone(),
                _joined: joined,
            }),
            Err(e) => {
                let _ = self.session.leave();
                Err(ChannelError::Protocol(format!(
                    "join reply for {} is not a snapshot: {e}",
                    self.session.topic()
                )))
            }
        }
    }

    /// Submit a comment and wait for the server's acknowledgment.
    pub async fn add_comment(&self, content: impl Into<String>) -> Result<Value, ChannelError> {
        let payload = serde_json::to_value(AddComment {
            content: content.into(),
        })
        .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.session.push(ADD_COMMENT_EVENT, payload).await
    }

    /// Follow new comments. Replaces any previous new-comment handler.
    pub fn on_new_comment(&self, handler: impl Fn(Comment) + Send + Sync + 'static) -> BindingRef {
        let topic = self.session.topic().to_owned();
        self.session
            .on(&new_comment_event(&self.topic_id), move |payload| {
                match serde_json::from_value::<NewComment>(payload.clone()) {
                    Ok(event) => handler(event.comment),
                    Err(e) => warn!(%topic, error = %e, "malformed new-comment payload"),
                }
            })
    }

    /// Receive the fresh snapshot after a transparent rejoin.
    pub fn on_resync(&self, handler: impl Fn(Snapshot) + Send + Sync + 'static) -> BindingRef {
        let topic = self.session.topic().to_owned();
        self.session.on_resync(move |payload| {
            match serde_json::from_value::<Snapshot>(payload.clone()) {
                Ok(snapshot) => handler(snapshot),
                Err(e) => warn!(%topic, error = %e, "malformed resync snapshot"),
            }
        })
    }

    /// Remove a binding made through this thread.
    pub fn off(&self, binding: &BindingRef) -> bool {
        self.session.off(binding)
    }

    /// Leave the thread. Pending comment submissions fail as cancelled.
    pub fn leave(&self) -> Result<(), ChannelError> {
        self.session.leave()
    }
}
