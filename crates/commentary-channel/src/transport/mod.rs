//! Link transports.
//!
//! A [`Transport`] opens one bidirectional text link to the socket URL. The
//! connection task owns the link it gets back and asks for a new one after
//! every drop, so transports hold no reconnect logic of their own.
//!
//! - [`WebSocketTransport`]: `tokio-tungstenite` client
//! - [`MemoryTransport`]: in-process pair for tests and embedders

pub mod memory;
pub mod websocket;

use std::pin::Pin;

use async_trait::async_trait;
use commentary_core::ConnectionError;
use futures::{Sink, Stream};
use url::Url;

pub use memory::{MemoryServer, MemoryTransport, ServerLink};
pub use websocket::WebSocketTransport;

/// Outbound half of a link.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;

/// Inbound half of a link. The stream ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// An open link carrying encoded frames.
pub struct Link {
    /// Frames to the server.
    pub sink: FrameSink,
    /// Frames from the server.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens links to a socket URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the handshake and return the open link.
    ///
    /// A refused handshake is reported as [`ConnectionError::Rejected`].
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError>;
}
