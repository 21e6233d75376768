//! # commentary-channel
//!
//! Client for realtime comment threads over a multiplexed topic channel
//! protocol.
//!
//! - [`Connection`]: one shared link with heartbeat, backoff reconnect and
//!   an outbound queue
//! - [`ChannelSession`]: one membership in one topic (join, push, leave,
//!   event handlers)
//! - [`SubscriptionRegistry`]: at most one live session per topic
//! - [`CommentClient`] / [`CommentThread`]: the typed comment API on top
//! - [`transport`]: WebSocket and in-process links
//!
//! ```ignore
//! let client = CommentClient::connect(ConnectionOptions::new("ws://localhost:4000/socket"))?;
//! let opened = client
//!     .open_topic_with("42", |comment| println!("{}: {}", comment.author_label(), comment.content))
//!     .await?;
//! for comment in &opened.snapshot().comments {
//!     println!("{}: {}", comment.author_label(), comment.content);
//! }
//! // New comments are printed only from here on.
//! let thread = opened.start();
//! thread.add_comment("hello").await?;
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod connection;
pub mod dispatcher;
mod heartbeat;
pub mod options;
pub mod protocol;
pub mod registry;
pub mod session;
mod tracker;
pub mod transport;

pub use client::{CommentClient, CommentThread, OpenedTopic};
pub use connection::Connection;
pub use dispatcher::{BindingRef, EventHandler};
pub use options::ConnectionOptions;
pub use protocol::{Frame, Reply, ReplyStatus};
pub use registry::SubscriptionRegistry;
pub use session::{ChannelSession, Joined, RESYNC_EVENT};
pub use transport::{
    Link, MemoryServer, MemoryTransport, ServerLink, Transport, WebSocketTransport,
};

pub use commentary_core::{
    ChannelError, Comment, CommentAuthor, ConnectionError, LinkState, MsgRef, Operation,
    SessionId, SessionState, Snapshot,
};
pub use commentary_settings::RejoinSnapshot;
