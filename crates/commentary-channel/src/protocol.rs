//! Channel wire frames.
//!
//! Every frame is a five element JSON array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! `join_ref` names the channel incarnation a frame belongs to; `ref`
//! correlates a client request with its `phx_reply`. Server pushes carry
//! `null` for `ref` (and usually for `join_ref`).

use commentary_core::MsgRef;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Topic reserved for connection-level traffic (heartbeats).
pub const PHOENIX_TOPIC: &str = "phoenix";
/// Heartbeat event on [`PHOENIX_TOPIC`].
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Join request.
pub const PHX_JOIN: &str = "phx_join";
/// Leave request.
pub const PHX_LEAVE: &str = "phx_leave";
/// Reply to any request carrying a `ref`.
pub const PHX_REPLY: &str = "phx_reply";
/// The server-side channel crashed; the client should rejoin.
pub const PHX_ERROR: &str = "phx_error";
/// The server closed the channel.
pub const PHX_CLOSE: &str = "phx_close";

type WireFrame = (Option<MsgRef>, Option<MsgRef>, String, String, Value);

/// One decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Ref of the join that opened the channel this frame belongs to.
    pub join_ref: Option<MsgRef>,
    /// Correlation ref of a request or its reply.
    pub msg_ref: Option<MsgRef>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

impl Frame {
    /// Join request for `topic`. The join's own ref doubles as its `join_ref`.
    pub fn join(join_ref: MsgRef, topic: impl Into<String>, params: Value) -> Self {
        Self {
            join_ref: Some(join_ref.clone()),
            msg_ref: Some(join_ref),
            topic: topic.into(),
            event: PHX_JOIN.to_owned(),
            payload: params,
        }
    }

    /// Leave request for the channel opened by `join_ref`.
    pub fn leave(join_ref: MsgRef, msg_ref: MsgRef, topic: impl Into<String>) -> Self {
        Self {
            join_ref: Some(join_ref),
            msg_ref: Some(msg_ref),
            topic: topic.into(),
            event: PHX_LEAVE.to_owned(),
            payload: json!({}),
        }
    }

    /// Client push on a joined channel.
    pub fn push(
        join_ref: Option<MsgRef>,
        msg_ref: MsgRef,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref: Some(msg_ref),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Connection heartbeat.
    pub fn heartbeat(msg_ref: MsgRef) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref),
            topic: PHOENIX_TOPIC.to_owned(),
            event: HEARTBEAT_EVENT.to_owned(),
            payload: json!({}),
        }
    }

    /// Server push with no correlation ref.
    pub fn broadcast(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Reply to `request` with `status` and `response`.
    pub fn reply_to(request: &Frame, status: ReplyStatus, response: Value) -> Self {
        Self {
            join_ref: request.join_ref.clone(),
            msg_ref: request.msg_ref.clone(),
            topic: request.topic.clone(),
            event: PHX_REPLY.to_owned(),
            payload: json!({ "status": status, "response": response }),
        }
    }

    /// Serialize to the wire array.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&(
            &self.join_ref,
            &self.msg_ref,
            &self.topic,
            &self.event,
            &self.payload,
        ))
    }

    /// Parse a wire array. Anything but exactly five elements is an error.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let (join_ref, msg_ref, topic, event, payload): WireFrame = serde_json::from_str(text)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }

    /// Whether this is a reply on the connection topic (a heartbeat ack).
    pub fn is_connection_reply(&self) -> bool {
        self.topic == PHOENIX_TOPIC && self.event == PHX_REPLY
    }
}

/// Status field of a `phx_reply`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Request succeeded.
    Ok,
    /// Request failed; `response` carries the reason.
    Error,
}

/// Decoded `phx_reply` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Success payload or failure reason.
    pub response: Value,
}

#[derive(Deserialize)]
struct RawReply {
    status: String,
    #[serde(default)]
    response: Value,
}

impl Reply {
    /// Parse a reply payload. Any status other than `ok` counts as an error.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let raw = RawReply::deserialize(payload).ok()?;
        let status = if raw.status == "ok" {
            ReplyStatus::Ok
        } else {
            ReplyStatus::Error
        };
        Some(Self {
            status,
            response: raw.response,
        })
    }

    /// `Ok(response)` or `Err(reason)`.
    pub fn into_result(self) -> Result<Value, Value> {
        match self.status {
            ReplyStatus::Ok => Ok(self.response),
            ReplyStatus::Error => Err(self.response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_wire_shape() {
        let frame = Frame::join(MsgRef::from(1), "comments:42", json!({}));
        insta::assert_snapshot!(frame.encode().unwrap(), @r#"["1","1","comments:42","phx_join",{}]"#);
    }

    #[test]
    fn heartbeat_wire_shape() {
        let frame = Frame::heartbeat(MsgRef::from(7));
        insta::assert_snapshot!(frame.encode().unwrap(), @r#"[null,"7","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn push_wire_shape() {
        let frame = Frame::push(
            Some(MsgRef::from(1)),
            MsgRef::from(3),
            "comments:42",
            "comment:add",
            json!({"content": "hello"}),
        );
        insta::assert_snapshot!(
            frame.encode().unwrap(),
            @r#"["1","3","comments:42","comment:add",{"content":"hello"}]"#
        );
    }

    #[test]
    fn decode_server_push_with_null_refs() {
        let frame = Frame::decode(
            r#"[null,null,"comments:42","comments:42:new",{"comment":{"content":"second"}}]"#,
        )
        .unwrap();
        assert!(frame.join_ref.is_none());
        assert!(frame.msg_ref.is_none());
        assert_eq!(frame.event, "comments:42:new");
        assert_eq!(frame.payload["comment"]["content"], "second");
    }

    #[test]
    fn decode_rejects_wrong_arity() {
        assert!(Frame::decode(r#"["1","1","t","e"]"#).is_err());
        assert!(Frame::decode(r#"["1","1","t","e",{},1]"#).is_err());
        assert!(Frame::decode(r#"{"topic":"t"}"#).is_err());
    }

    #[test]
    fn reply_to_echoes_refs() {
        let join = Frame::join(MsgRef::from(4), "comments:1", json!({}));
        let reply = Frame::reply_to(&join, ReplyStatus::Ok, json!({"comments": []}));
        assert_eq!(reply.msg_ref, Some(MsgRef::from(4)));
        assert_eq!(reply.join_ref, Some(MsgRef::from(4)));
        assert_eq!(reply.event, PHX_REPLY);

        let decoded = Frame::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn reply_parsing() {
        let ok = Reply::from_payload(&json!({"status": "ok", "response": {"id": 1}})).unwrap();
        assert_eq!(ok.into_result(), Ok(json!({"id": 1})));

        let err =
            Reply::from_payload(&json!({"status": "error", "response": {"reason": "nope"}}))
                .unwrap();
        assert_eq!(err.into_result(), Err(json!({"reason": "nope"})));

        let timeout = Reply::from_payload(&json!({"status": "timeout"})).unwrap();
        assert_eq!(timeout.status, ReplyStatus::Error);
        assert_eq!(timeout.response, Value::Null);

        assert!(Reply::from_payload(&json!({"response": {}})).is_none());
    }

    #[test]
    fn connection_reply_detection() {
        let hb = Frame::heartbeat(MsgRef::from(2));
        let ack = Frame::reply_to(&hb, ReplyStatus::Ok, json!({}));
        assert!(ack.is_connection_reply());
        assert!(!hb.is_connection_reply());
    }
}
