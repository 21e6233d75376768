//! Pending push requests for one session, keyed by their ref.
//!
//! An entry resolves at most once: resolving removes it, so a duplicate
//! acknowledgment finds nothing and is ignored. Entries remember whether
//! their frame reached the link; only those fail when the link drops; the
//! rest stay queued and go out after the session rejoins.

use std::collections::HashMap;

use commentary_core::{ChannelError, ConnectionError, MsgRef, Operation};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::Reply;

/// Completion side of a request.
pub(crate) type ReplyTx = oneshot::Sender<Result<Value, ChannelError>>;
/// Caller side of a request.
pub(crate) type ReplyRx = oneshot::Receiver<Result<Value, ChannelError>>;

struct PendingRequest {
    event: String,
    sent: bool,
    reply: ReplyTx,
}

pub(crate) struct RequestTracker {
    topic: String,
    pending: HashMap<MsgRef, PendingRequest>,
}

impl RequestTracker {
    pub(crate) fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            pending: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, msg_ref: MsgRef, event: impl Into<String>) -> ReplyRx {
        let (reply, rx) = oneshot::channel();
        let _ = self.pending.insert(
            msg_ref,
            PendingRequest {
                event: event.into(),
                sent: false,
                reply,
            },
        );
        rx
    }

    pub(crate) fn mark_sent(&mut self, msg_ref: &MsgRef) {
        if let Some(entry) = self.pending.get_mut(msg_ref) {
            entry.sent = true;
        }
    }

    /// Complete the request for `msg_ref` from a server reply.
    ///
    /// Returns `false` when nothing is pending under that ref.
    pub(crate) fn resolve(&mut self, msg_ref: &MsgRef, reply: Reply) -> bool {
        let Some(entry) = self.pending.remove(msg_ref) else {
            return false;
        };
        let outcome = reply.into_result().map_err(|reason| ChannelError::Push {
            topic: self.topic.clone(),
            event: entry.event,
            reason,
        });
        let _ = entry.reply.send(outcome);
        true
    }

    pub(crate) fn fail(&mut self, msg_ref: &MsgRef, err: ChannelError) -> bool {
        match self.pending.remove(msg_ref) {
            Some(entry) => {
                let _ = entry.reply.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every request whose frame already went out. Unsent ones stay.
    pub(crate) fn fail_sent(&mut self, err: &ConnectionError) -> usize {
        let sent: Vec<MsgRef> = self
            .pending
            .iter()
            .filter(|(_, e)| e.sent)
            .map(|(r, _)| r.clone())
            .collect();
        for msg_ref in &sent {
            let _ = self.fail(msg_ref, ChannelError::Connection(err.clone()));
        }
        sent.len()
    }

    pub(crate) fn fail_all(&mut self, err: &ChannelError) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(err.clone()));
        }
        count
    }

    /// Fail everything as cancelled by `leave()`.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let err = ChannelError::Cancelled {
            topic: self.topic.clone(),
            operation: Operation::Push,
        };
        self.fail_all(&err)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyStatus;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn ok(response: Value) -> Reply {
        Reply {
            status: ReplyStatus::Ok,
            response,
        }
    }

    #[tokio::test]
    async fn ok_reply_resolves_with_response() {
        let mut t = RequestTracker::new("comments:1");
        let rx = t.register(MsgRef::from(2), "comment:add");
        assert!(t.resolve(&MsgRef::from(2), ok(json!({"id": 5}))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"id": 5})));
        assert_eq!(t.len(), 0);
    }

    #[tokio::test]
    async fn error_reply_carries_reason_and_event() {
        let mut t = RequestTracker::new("comments:1");
        let rx = t.register(MsgRef::from(2), "comment:add");
        let reply = Reply {
            status: ReplyStatus::Error,
            response: json!({"errors": {"content": ["can't be blank"]}}),
        };
        assert!(t.resolve(&MsgRef::from(2), reply));
        let err = rx.await.unwrap().unwrap_err();
        assert_matches!(err, ChannelError::Push { ref event, .. } if event == "comment:add");
        assert_eq!(
            err.reason(),
            Some(&json!({"errors": {"content": ["can't be blank"]}}))
        );
    }

    #[tokio::test]
    async fn duplicate_ack_is_ignored() {
        let mut t = RequestTracker::new("t");
        let rx = t.register(MsgRef::from(1), "e");
        assert!(t.resolve(&MsgRef::from(1), ok(json!(1))));
        assert!(!t.resolve(&MsgRef::from(1), ok(json!(2))));
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn link_loss_fails_only_sent_requests() {
        let mut t = RequestTracker::new("t");
        let sent = t.register(MsgRef::from(1), "e");
        let queued = t.register(MsgRef::from(2), "e");
        t.mark_sent(&MsgRef::from(1));

        assert_eq!(t.fail_sent(&ConnectionError::LinkLost), 1);
        assert_eq!(
            sent.await.unwrap(),
            Err(ChannelError::Connection(ConnectionError::LinkLost))
        );
        assert_eq!(t.len(), 1);

        assert!(t.resolve(&MsgRef::from(2), ok(json!("late"))));
        assert_eq!(queued.await.unwrap(), Ok(json!("late")));
    }

    #[tokio::test]
    async fn cancel_all_is_a_cancellation() {
        let mut t = RequestTracker::new("comments:9");
        let a = t.register(MsgRef::from(1), "e");
        let b = t.register(MsgRef::from(2), "e");
        assert_eq!(t.cancel_all(), 2);
        for rx in [a, b] {
            let err = rx.await.unwrap().unwrap_err();
            assert!(err.is_cancellation());
        }
        assert_eq!(t.len(), 0);
    }
}
