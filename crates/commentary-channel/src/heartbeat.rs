//! Connection heartbeat liveness.
//!
//! One heartbeat is outstanding at a time. At each tick, if the previous
//! heartbeat was never acknowledged the link is considered dead.

use std::time::Duration;

use commentary_core::MsgRef;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// What the connection should do at a heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeartbeatTick {
    /// Send a new heartbeat.
    Send,
    /// The previous heartbeat went unanswered.
    TimedOut(MsgRef),
}

pub(crate) struct Heartbeat {
    interval: Option<Interval>,
    outstanding: Option<MsgRef>,
}

impl Heartbeat {
    /// First tick fires one full `period` after creation. `None` never ticks.
    pub(crate) fn new(period: Option<Duration>) -> Self {
        let interval = period.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            interval,
            outstanding: None,
        }
    }

    /// Wait for the next tick and decide what it means.
    pub(crate) async fn tick(&mut self) -> HeartbeatTick {
        match self.interval.as_mut() {
            Some(interval) => {
                let _ = interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
        match &self.outstanding {
            Some(msg_ref) => HeartbeatTick::TimedOut(msg_ref.clone()),
            None => HeartbeatTick::Send,
        }
    }

    pub(crate) fn sent(&mut self, msg_ref: MsgRef) {
        self.outstanding = Some(msg_ref);
    }

    /// Clear the outstanding heartbeat if `msg_ref` acknowledges it.
    pub(crate) fn acknowledge(&mut self, msg_ref: Option<&MsgRef>) -> bool {
        if msg_ref.is_some() && self.outstanding.as_ref() == msg_ref {
            self.outstanding = None;
            true
        } else {
            false
        }
    }
}
