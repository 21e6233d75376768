//! Error taxonomy for channel sessions and the transport connection.
//!
//! - [`ConnectionError`]: the link is down, rejected, or saturated. The
//!   connection retries on its own with backoff; callers see these only when
//!   an operation could not be carried.
//! - [`ChannelError`]: what a caller of `join` / `push` / `leave` receives.
//!   `Join` and `Push` carry the server-provided reason verbatim; `Cancelled`
//!   is kept distinct so callers can tell a local `leave()` from a rejection.
//!
//! Both are `Clone`: one link failure is fanned out to every pending request.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::SessionState;

/// Link-level failure.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConnectionError {
    /// The connection was shut down (explicit disconnect or dropped handle).
    #[error("connection closed")]
    Closed,

    /// The server refused the handshake (e.g. bad token).
    #[error("connection rejected by server (HTTP {status})")]
    Rejected {
        /// HTTP status of the refused upgrade.
        status: u16,
    },

    /// The link dropped after the frame was written; its reply will never arrive.
    #[error("link lost before the server replied")]
    LinkLost,

    /// Too many frames queued while the link is down.
    #[error("outbound queue full ({limit} messages)")]
    QueueFull {
        /// Configured queue capacity.
        limit: usize,
    },

    /// Reconnection attempts exhausted.
    #[error("gave up reconnecting after {attempts} attempts")]
    GaveUp {
        /// Number of failed attempts.
        attempts: u32,
    },

    /// Endpoint URL could not be built.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Whether reconnecting may fix this.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LinkLost | Self::QueueFull { .. } | Self::Transport(_))
    }
}

/// Session operation named in [`ChannelError::InvalidState`] and
/// [`ChannelError::Cancelled`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// `join`
    Join,
    /// `push`
    Push,
    /// `leave`
    Leave,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Push => write!(f, "push"),
            Self::Leave => write!(f, "leave"),
        }
    }
}

/// Error surfaced to callers of channel session operations.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ChannelError {
    /// Link-level failure.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// The server refused to join the topic. Terminal for this session.
    #[error("join refused for {topic}: {reason}")]
    Join {
        /// Channel topic.
        topic: String,
        /// Server-provided reason payload.
        reason: Value,
    },

    /// The server rejected a push. The session stays joined.
    #[error("push {event} rejected on {topic}: {reason}")]
    Push {
        /// Channel topic.
        topic: String,
        /// Pushed event name.
        event: String,
        /// Server-provided reason payload.
        reason: Value,
    },

    /// A pending request was discarded locally by `leave()` or disconnect.
    #[error("{operation} on {topic} cancelled")]
    Cancelled {
        /// Channel topic.
        topic: String,
        /// The operation that was pending.
        operation: Operation,
    },

    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} {topic} while {state}")]
    InvalidState {
        /// Channel topic.
        topic: String,
        /// Attempted operation.
        operation: Operation,
        /// State at the time of the call.
        state: SessionState,
    },

    /// A payload did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether this is a local cancellation rather than a server decision.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Server-provided reason for `Join` / `Push` failures.
    #[must_use]
    pub fn reason(&self) -> Option<&Value> {
        match self {
            Self::Join { reason, .. } | Self::Push { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
