//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial settings file only
//! overrides what it names.

use commentary_core::BackoffConfig;
use serde::{Deserialize, Serialize};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommentarySettings {
    /// Connection and channel protocol settings.
    pub connection: ConnectionSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

/// What a session does with the snapshot returned by a rejoin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejoinSnapshot {
    /// Hand the fresh snapshot to the session's resync handler.
    #[default]
    Redeliver,
    /// Drop it; only live events after the rejoin are delivered.
    Suppress,
}

/// Transport connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Socket endpoint, e.g. `ws://127.0.0.1:4000/socket`.
    pub endpoint: String,
    /// Opaque auth token passed as a connect parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Channel protocol version sent as `vsn`.
    pub protocol_version: String,
    /// Heartbeat interval in milliseconds (0 disables heartbeats).
    pub heartbeat_interval_ms: u64,
    /// Timeout for a single link open attempt in milliseconds.
    pub connect_timeout_ms: u64,
    /// Frames held while the link is down before pushes are refused.
    pub max_queued_messages: usize,
    /// Give up after this many consecutive failed link attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// Backoff between link reconnect attempts.
    pub reconnect: BackoffConfig,
    /// Backoff before rejoining a channel the server errored.
    pub rejoin: BackoffConfig,
    /// Snapshot policy for rejoins.
    pub rejoin_snapshot: RejoinSnapshot,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:4000/socket".to_string(),
            token: None,
            protocol_version: "2.0.0".to_string(),
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_queued_messages: 256,
            max_reconnect_attempts: None,
            reconnect: BackoffConfig::default(),
            rejoin: BackoffConfig {
                base_delay_ms: 1_000,
                max_delay_ms: 5_000,
                jitter_factor: 0.2,
            },
            rejoin_snapshot: RejoinSnapshot::Redeliver,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = CommentarySettings::default();
        assert_eq!(s.connection.endpoint, "ws://127.0.0.1:4000/socket");
        assert_eq!(s.connection.protocol_version, "2.0.0");
        assert_eq!(s.connection.heartbeat_interval_ms, 30_000);
        assert_eq!(s.connection.max_queued_messages, 256);
        assert!(s.connection.token.is_none());
        assert!(s.connection.max_reconnect_attempts.is_none());
        assert_eq!(s.connection.rejoin.base_delay_ms, 1_000);
        assert_eq!(s.connection.rejoin_snapshot, RejoinSnapshot::Redeliver);
        assert_eq!(s.logging.level, "warn");
        assert!(!s.logging.json);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let s: CommentarySettings = serde_json::from_str(
            r#"{"connection": {"endpoint": "wss://example.test/socket", "rejoinSnapshot": "suppress"}}"#,
        )
        .unwrap();
        assert_eq!(s.connection.endpoint, "wss://example.test/socket");
        assert_eq!(s.connection.rejoin_snapshot, RejoinSnapshot::Suppress);
        assert_eq!(s.connection.heartbeat_interval_ms, 30_000);
        assert_eq!(s.logging.level, "warn");
    }

    #[test]
    fn token_not_serialized_when_absent() {
        let json = serde_json::to_value(ConnectionSettings::default()).unwrap();
        assert!(json.get("token").is_none());
        assert!(json.get("maxReconnectAttempts").is_none());
        assert_eq!(json["heartbeatIntervalMs"], 30_000);
    }
}
