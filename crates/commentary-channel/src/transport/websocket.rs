//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use commentary_core::ConnectionError;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

use super::{Link, Transport};

/// Opens WebSocket links. Text messages carry frames; pings are answered by
/// the library and other message kinds are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError> {
        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(map_connect_error)?;
        debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::text(text))))
            .sink_map_err(|e| ConnectionError::Transport(e.to_string()));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server sent close");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn map_connect_error(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => ConnectionError::Rejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Url(e) => ConnectionError::InvalidEndpoint(e.to_string()),
        other => ConnectionError::Transport(other.to_string()),
    }
}
