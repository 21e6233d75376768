//! The connection task: link lifecycle, outbound queue and inbound routing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use commentary_core::{ConnectionError, LinkState, SessionState};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{Command, Outbound, RefCounter};
use crate::heartbeat::{Heartbeat, HeartbeatTick};
use crate::options::ConnectionOptions;
use crate::protocol::{Frame, PHX_CLOSE, PHX_ERROR, PHX_REPLY};
use crate::session::{PushRoute, ReplyOutcome, SessionShared, Teardown};
use crate::transport::{Link, Transport};

/// Why [`ConnectionTask::serve`] returned.
enum Exit {
    Shutdown,
    LinkDown(ConnectionError),
}

pub(super) struct ConnectionTask {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    url: Url,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    link_state: watch::Sender<LinkState>,
    refs: Arc<RefCounter>,
    channels: HashMap<String, Arc<SessionShared>>,
    queue: VecDeque<Outbound>,
    attempts: u32,
    gave_up: Arc<OnceLock<ConnectionError>>,
}

impl ConnectionTask {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        url: Url,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        cmd_tx: mpsc::WeakUnboundedSender<Command>,
        link_state: watch::Sender<LinkState>,
        refs: Arc<RefCounter>,
        gave_up: Arc<OnceLock<ConnectionError>>,
    ) -> Self {
        Self {
            transport,
            options,
            url,
            cmd_rx,
            cmd_tx,
            link_state,
            refs,
            channels: HashMap::new(),
            queue: VecDeque::new(),
            attempts: 0,
            gave_up,
        }
    }

    pub(super) async fn run(mut self, shutdown: CancellationToken) {
        loop {
            self.set_link_state(LinkState::Connecting);
            let opened = tokio::select! {
                () = shutdown.cancelled() => break,
                opened = self.open_link() => opened,
            };

            match opened {
                Ok(link) => {
                    if self.attempts > 0 {
                        info!(attempts = self.attempts, "link reopened");
                    } else {
                        info!("link open");
                    }
                    self.attempts = 0;
                    self.set_link_state(LinkState::Open);
                    match self.serve(link, &shutdown).await {
                        Exit::Shutdown => break,
                        Exit::LinkDown(reason) => {
                            info!(%reason, "link down");
                            self.set_link_state(LinkState::Closed);
                            self.link_lost();
                        }
                    }
                }
                Err(err) => {
                    self.attempts = self.attempts.saturating_add(1);
                    if let ConnectionError::Rejected { status } = err {
                        warn!(status, attempt = self.attempts, "handshake rejected");
                        self.set_link_state(LinkState::Errored);
                    } else {
                        warn!(error = %err, attempt = self.attempts, "connect failed");
                        self.set_link_state(LinkState::Closed);
                    }
                    if self
                        .options
                        .max_reconnect_attempts
                        .is_some_and(|max| self.attempts >= max)
                    {
                        self.give_up();
                        let _ = self.idle(None, &shutdown).await;
                        break;
                    }
                }
            }

            let delay = self.options.reconnect.delay(self.attempts, rand::random());
            debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = self.attempts,
                "reconnecting after backoff"
            );
            if self.idle(Some(delay), &shutdown).await {
                break;
            }
        }
        self.shut_down();
    }

    async fn open_link(&self) -> Result<Link, ConnectionError> {
        match tokio::time::timeout(self.options.connect_timeout, self.transport.open(&self.url))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Transport(format!(
                "connect timed out after {}ms",
                self.options.connect_timeout.as_millis()
            ))),
        }
    }

    /// Handle commands with no link until `delay` elapses (never for `None`).
    /// Returns `true` when the task should stop.
    async fn idle(&mut self, delay: Option<Duration>, shutdown: &CancellationToken) -> bool {
        let sleep = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return true,
                () = &mut sleep => return false,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return true };
                    // Without a link nothing is written, so this cannot fail.
                    let _ = self.handle_command(cmd, None).await;
                }
            }
        }
    }

    async fn serve(&mut self, mut link: Link, shutdown: &CancellationToken) -> Exit {
        if let Err(err) = self.rejoin_all(&mut link).await {
            return Exit::LinkDown(err);
        }
        let mut heartbeat = Heartbeat::new(self.options.heartbeat_interval);

        loop {
            let step = tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = link.sink.close().await;
                    return Exit::Shutdown;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, Some(&mut link)).await,
                    None => {
                        let _ = link.sink.close().await;
                        return Exit::Shutdown;
                    }
                },
                inbound = link.stream.next() => match inbound {
                    Some(Ok(text)) => self.route(&text, &mut link, &mut heartbeat).await,
                    Some(Err(err)) => Err(err),
                    None => Err(ConnectionError::Transport("link closed by peer".into())),
                },
                tick = heartbeat.tick() => match tick {
                    HeartbeatTick::Send => {
                        let msg_ref = self.refs.next();
                        heartbeat.sent(msg_ref.clone());
                        write(&mut link, &Frame::heartbeat(msg_ref)).await
                    }
                    HeartbeatTick::TimedOut(msg_ref) => {
                        warn!(%msg_ref, "heartbeat timeout");
                        Err(ConnectionError::Transport("heartbeat timeout".into()))
                    }
                },
            };
            if let Err(err) = step {
                return Exit::LinkDown(err);
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        link: Option<&mut Link>,
    ) -> Result<(), ConnectionError> {
        match command {
            Command::Join(session) => {
                if let Some(reason) = self.gave_up.get() {
                    let _ = session.terminate(SessionState::Errored, &Teardown::Failed(reason.clone()));
                    return Ok(());
                }
                if session.state() != SessionState::Joining {
                    return Ok(());
                }
                let _ = self
                    .channels
                    .insert(session.topic().to_owned(), Arc::clone(&session));
                if let Some(link) = link {
                    self.send_join(&session, link).await?;
                }
            }
            Command::Push(outbound) => self.handle_push(outbound, link).await?,
            Command::Leave { session, join_ref } => {
                let topic = session.topic().to_owned();
                if self
                    .channels
                    .get(&topic)
                    .is_some_and(|s| Arc::ptr_eq(s, &session))
                {
                    let _ = self.channels.remove(&topic);
                }
                let id = session.id();
                self.queue.retain(|o| o.origin.as_ref() != Some(id));
                if let (Some(link), Some(join_ref)) = (link, join_ref) {
                    debug!(%topic, %join_ref, "leaving channel");
                    let frame = Frame::leave(join_ref, self.refs.next(), topic);
                    write(link, &frame).await?;
                }
            }
            Command::Release(session) => session.release(),
            Command::Rejoin(session) => {
                let current = self
                    .channels
                    .get(session.topic())
                    .is_some_and(|s| Arc::ptr_eq(s, &session));
                if let (true, Some(link)) = (current, link) {
                    self.send_join(&session, link).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_join(
        &self,
        session: &SessionShared,
        link: &mut Link,
    ) -> Result<(), ConnectionError> {
        let join_ref = self.refs.next();
        if let Some(frame) = session.begin_join(join_ref.clone()) {
            debug!(topic = %session.topic(), %join_ref, "joining");
            write(link, &frame).await?;
        }
        Ok(())
    }

    async fn handle_push(
        &mut self,
        outbound: Outbound,
        link: Option<&mut Link>,
    ) -> Result<(), ConnectionError> {
        if self.gave_up.get().is_some() {
            debug!(topic = %outbound.topic, msg_ref = %outbound.msg_ref, "connection gave up, push dropped");
            return Ok(());
        }
        let limit = self.options.max_queued_messages;
        if self.queue.len() >= limit {
            warn!(topic = %outbound.topic, event = %outbound.event, limit, "outbound queue full");
            if let Some(session) = self.channels.get(&outbound.topic) {
                session.fail_request(
                    &outbound.msg_ref,
                    ConnectionError::QueueFull { limit }.into(),
                );
            }
            return Ok(());
        }
        trace!(topic = %outbound.topic, msg_ref = %outbound.msg_ref, "queued push");
        self.queue.push_back(outbound);
        match link {
            Some(link) => self.flush_queue(link).await,
            None => Ok(()),
        }
    }

    /// Rejoin every session waiting for the link, then flush the queue.
    async fn rejoin_all(&mut self, link: &mut Link) -> Result<(), ConnectionError> {
        let sessions: Vec<Arc<SessionShared>> = self.channels.values().cloned().collect();
        for session in sessions {
            if session.state() == SessionState::Joining {
                self.send_join(&session, link).await?;
            }
        }
        self.flush_queue(link).await
    }

    /// Write every queued push whose session is joined; keep the rest in
    /// order.
    async fn flush_queue(&mut self, link: &mut Link) -> Result<(), ConnectionError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut self.queue).into_iter();
        let mut held = VecDeque::new();
        while let Some(outbound) = pending.next() {
            let (session, route) = self.route_for(&outbound);
            match route {
                PushRoute::Send(join_ref) => {
                    if let Some(session) = &session {
                        session.mark_sent(&outbound.msg_ref);
                    }
                    let frame = Frame::push(
                        join_ref,
                        outbound.msg_ref,
                        outbound.topic,
                        outbound.event,
                        outbound.payload,
                    );
                    if let Err(err) = write(link, &frame).await {
                        held.extend(pending);
                        self.queue = held;
                        return Err(err);
                    }
                }
                PushRoute::Hold => held.push_back(outbound),
                PushRoute::Discard => {
                    trace!(topic = %outbound.topic, msg_ref = %outbound.msg_ref, "discarded push for ended session");
                }
            }
        }
        self.queue = held;
        Ok(())
    }

    /// Session an outbound push belongs to and what to do with it now.
    fn route_for(&self, outbound: &Outbound) -> (Option<Arc<SessionShared>>, PushRoute) {
        match (self.channels.get(&outbound.topic), &outbound.origin) {
            (Some(session), Some(origin)) if session.id() != origin => (None, PushRoute::Discard),
            (Some(session), _) => (Some(Arc::clone(session)), session.push_route()),
            (None, Some(_)) => (None, PushRoute::Discard),
            (None, None) => (None, PushRoute::Send(None)),
        }
    }

    async fn route(
        &mut self,
        text: &str,
        link: &mut Link,
        heartbeat: &mut Heartbeat,
    ) -> Result<(), ConnectionError> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return Ok(());
            }
        };
        if frame.is_connection_reply() {
            if !heartbeat.acknowledge(frame.msg_ref.as_ref()) {
                debug!(msg_ref = ?frame.msg_ref, "unexpected connection reply");
            }
            return Ok(());
        }
        let Some(session) = self.channels.get(&frame.topic).cloned() else {
            debug!(topic = %frame.topic, event = %frame.event, "no session for topic, dropped");
            return Ok(());
        };

        match frame.event.as_str() {
            PHX_REPLY => match session.handle_reply(&frame, self.options.rejoin_snapshot) {
                ReplyOutcome::Joined | ReplyOutcome::Rejoined => self.flush_queue(link).await?,
                ReplyOutcome::JoinFailed => self.forget(&session),
                ReplyOutcome::Resolved | ReplyOutcome::Unmatched => {}
            },
            PHX_ERROR => {
                if let Some(attempt) = session.server_error(&frame) {
                    self.schedule_rejoin(session, attempt);
                }
            }
            PHX_CLOSE => {
                if session.server_close(&frame) {
                    self.forget(&session);
                }
            }
            _ => session.handle_event(frame),
        }
        Ok(())
    }

    /// Drop a terminal session and anything it still had queued.
    fn forget(&mut self, session: &Arc<SessionShared>) {
        if self
            .channels
            .get(session.topic())
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            let _ = self.channels.remove(session.topic());
        }
        let id = session.id();
        self.queue.retain(|o| o.origin.as_ref() != Some(id));
    }

    fn schedule_rejoin(&self, session: Arc<SessionShared>, attempt: u32) {
        let delay = self.options.rejoin.delay(attempt, rand::random());
        info!(
            topic = %session.topic(),
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling rejoin"
        );
        let cmd_tx = self.cmd_tx.clone();
        drop(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(Command::Rejoin(session));
            }
        }));
    }

    fn link_lost(&mut self) {
        for session in self.channels.values() {
            session.link_lost();
        }
        self.channels.retain(|_, s| !s.state().is_terminal());
    }

    fn give_up(&mut self) {
        let reason = ConnectionError::GaveUp {
            attempts: self.attempts,
        };
        warn!(attempts = self.attempts, "giving up reconnecting");
        let _ = self.gave_up.set(reason.clone());
        let teardown = Teardown::Failed(reason);
        for (_, session) in self.channels.drain() {
            let _ = session.terminate(SessionState::Errored, &teardown);
        }
        self.queue.clear();
        self.set_link_state(LinkState::Errored);
    }

    fn shut_down(&mut self) {
        // Joins submitted but never seen must not wait forever.
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Join(session) => {
                    let _ = session.terminate(SessionState::Left, &Teardown::Cancelled);
                }
                Command::Push(_)
                | Command::Leave { .. }
                | Command::Release(_)
                | Command::Rejoin(_) => {}
            }
        }
        for (_, session) in self.channels.drain() {
            let _ = session.terminate(SessionState::Left, &Teardown::Cancelled);
        }
        self.queue.clear();
        self.set_link_state(LinkState::Closed);
        info!("connection closed");
    }

    fn set_link_state(&self, state: LinkState) {
        let previous = self.link_state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "link state");
        }
    }
}

async fn write(link: &mut Link, frame: &Frame) -> Result<(), ConnectionError> {
    let text = frame
        .encode()
        .map_err(|e| ConnectionError::Transport(format!("encode frame: {e}")))?;
    trace!(topic = %frame.topic, event = %frame.event, "send");
    link.sink.send(text).await
}
