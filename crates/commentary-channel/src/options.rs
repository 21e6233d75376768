//! Runtime options for a [`Connection`](crate::Connection).

use std::time::Duration;

use commentary_core::{BackoffConfig, ConnectionError};
use commentary_settings::{ConnectionSettings, RejoinSnapshot};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Everything the connection task needs, resolved from settings.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Socket endpoint, e.g. `ws://127.0.0.1:4000/socket`.
    pub endpoint: String,
    /// Opaque auth token sent as the `token` connect parameter.
    pub token: Option<SecretString>,
    /// Protocol version sent as `vsn`.
    pub protocol_version: String,
    /// Heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Upper bound on one link open attempt.
    pub connect_timeout: Duration,
    /// Frames held while the link is down before pushes fail with `QueueFull`.
    pub max_queued_messages: usize,
    /// Give up after this many consecutive failed opens. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Backoff between link attempts.
    pub reconnect: BackoffConfig,
    /// Backoff before rejoining a channel the server errored.
    pub rejoin: BackoffConfig,
    /// What a rejoin does with its fresh snapshot.
    pub rejoin_snapshot: RejoinSnapshot,
}

impl ConnectionOptions {
    /// Defaults for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Set the auth token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    /// Build `<endpoint>/websocket?token=..&vsn=..`.
    pub fn socket_url(&self) -> Result<Url, ConnectionError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "{}: scheme must be ws or wss",
                self.endpoint
            )));
        }
        let _ = url
            .path_segments_mut()
            .map_err(|()| ConnectionError::InvalidEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .push("websocket");
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                let _ = query.append_pair("token", token.expose_secret());
            }
            let _ = query.append_pair("vsn", &self.protocol_version);
        }
        Ok(url)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectionOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            token: settings.token.clone().map(SecretString::from),
            protocol_version: settings.protocol_version.clone(),
            heartbeat_interval: (settings.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(settings.heartbeat_interval_ms)),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            max_queued_messages: settings.max_queued_messages.max(1),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            reconnect: settings.reconnect.clone(),
            rejoin: settings.rejoin.clone(),
            rejoin_snapshot: settings.rejoin_snapshot,
        }
    }
}
