//! Lifecycle states for the transport link and for channel sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the underlying transport link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Opening (or re-opening) the link.
    Connecting,
    /// Link is up; frames flow.
    Open,
    /// Link is down: not yet started, waiting out a backoff, or disconnected.
    Closed,
    /// The last attempt was rejected by the server, or retries were exhausted.
    Errored,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Lifecycle state of a channel session.
///
/// `idle → joining → joined`, then `joined → left` or `joining → errored`.
/// A reconnect moves a joined session back through `joining`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, join not yet requested.
    Idle,
    /// Join (or rejoin) in flight.
    Joining,
    /// Server accepted the join.
    Joined,
    /// Join refused or rejoin failed. Terminal.
    Errored,
    /// Left by the caller or closed by the server. Terminal.
    Left,
}

impl SessionState {
    /// Whether the session can never become active again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Errored | Self::Left)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Joining => write!(f, "joining"),
            Self::Joined => write!(f, "joined"),
            Self::Errored => write!(f, "errored"),
            Self::Left => write!(f, "left"),
        }
    }
}
