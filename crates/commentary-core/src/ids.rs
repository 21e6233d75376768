//! Branded ID newtypes.
//!
//! [`SessionId`] identifies one channel session *instance*. Two sessions for
//! the same topic (one left, one fresh) never share an ID, which is what lets
//! the registry refuse to evict a replacement on behalf of a stale session.
//!
//! [`MsgRef`] is the wire-level correlation handle. Refs are allocated from a
//! per-connection counter and rendered as decimal strings, as the channel
//! protocol expects.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a channel session instance.
    SessionId
}

/// Correlation handle linking an outbound frame to its reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgRef(String);

impl MsgRef {
    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for MsgRef {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<String> for MsgRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MsgRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for MsgRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_is_uuid() {
        let id = SessionId::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn msg_ref_from_counter() {
        assert_eq!(MsgRef::from(7).as_str(), "7");
    }

    #[test]
    fn msg_ref_serializes_as_plain_string() {
        let json = serde_json::to_string(&MsgRef::from(12)).unwrap();
        assert_eq!(json, "\"12\"");
    }

    #[test]
    fn msg_ref_equality_across_constructors() {
        assert_eq!(MsgRef::from(3), MsgRef::from("3"));
        assert_eq!(MsgRef::from(3), MsgRef::from("3".to_string()));
    }
}
