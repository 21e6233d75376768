//! # commentary-core
//!
//! Foundation types shared by every commentary crate:
//!
//! - **Comments**: [`Comment`], [`Snapshot`], [`NewComment`] as they travel on the wire
//! - **Branded IDs**: [`SessionId`] and the [`MsgRef`] correlation handle
//! - **State**: [`LinkState`] for the transport, [`SessionState`] for channel sessions
//! - **Errors**: [`ChannelError`] / [`ConnectionError`] via `thiserror`
//! - **Backoff**: exponential delay math used for reconnect and rejoin
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod comment;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod state;

pub use comment::{AddComment, Comment, CommentAuthor, NewComment, Snapshot};
pub use errors::{ChannelError, ConnectionError, Operation};
pub use ids::{MsgRef, SessionId};
pub use retry::BackoffConfig;
pub use state::{LinkState, SessionState};
