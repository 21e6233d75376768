//! Topic to session registry.
//!
//! At most one non-terminal session exists per topic. Callers that ask for
//! the same topic concurrently get handles to the same instance; a topic
//! whose session has ended gets a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use commentary_core::SessionId;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

use crate::connection::Connection;
use crate::session::ChannelSession;

pub(crate) type SessionMap = Mutex<HashMap<String, ChannelSession>>;

/// Creates and tracks the sessions of one connection.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    connection: Connection,
    sessions: Arc<SessionMap>,
}

impl SubscriptionRegistry {
    /// Registry creating sessions on `connection`.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connection shared by every session of this registry.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The live session for `topic`, or a new `idle` one joined with an
    /// empty payload.
    pub fn get_or_create(&self, topic: &str) -> ChannelSession {
        self.get_or_create_with(topic, json!({}))
    }

    /// Like [`get_or_create`](Self::get_or_create) with explicit join
    /// parameters. `params` only applies when a new session is created.
    pub fn get_or_create_with(&self, topic: &str, params: Value) -> ChannelSession {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(topic) {
            if !existing.state().is_terminal() {
                return existing.clone();
            }
        }
        let session = ChannelSession::new(
            self.connection.clone(),
            topic,
            params,
            Arc::downgrade(&self.sessions),
        );
        debug!(topic, session_id = %session.id(), "created session");
        let _ = sessions.insert(topic.to_owned(), session.clone());
        session
    }

    /// The registered session for `topic`, if any.
    pub fn get(&self, topic: &str) -> Option<ChannelSession> {
        self.sessions.lock().get(topic).cloned()
    }

    /// Remove `topic` only if it still maps to the session `id`.
    ///
    /// A stale session can never evict the instance that replaced it.
    pub fn remove(&self, topic: &str, id: &SessionId) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.get(topic).is_some_and(|s| s.id() == id) {
            let _ = sessions.remove(topic);
            true
        } else {
            false
        }
    }

    /// Topics with a registered session.
    pub fn topics(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}
