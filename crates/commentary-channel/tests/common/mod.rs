//! Shared helpers for the scripted-server tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use commentary_channel::protocol::PHX_JOIN;
use commentary_channel::{
    CommentClient, Connection, ConnectionOptions, Frame, LinkState, MemoryServer,
    MemoryTransport, ServerLink, SessionState,
};
use commentary_core::BackoffConfig;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::timeout;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Options for the in-process server: no heartbeat, near-instant backoff.
pub fn options() -> ConnectionOptions {
    let fast = BackoffConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
    };
    ConnectionOptions {
        heartbeat_interval: None,
        reconnect: fast.clone(),
        rejoin: fast,
        ..ConnectionOptions::new("ws://memory.test/socket")
    }
}

/// Connection over a fresh in-process transport.
pub fn connect(options: ConnectionOptions) -> (Connection, MemoryServer) {
    let (transport, server) = MemoryTransport::pair();
    let connection = Connection::connect(Arc::new(transport), options).unwrap();
    (connection, server)
}

/// Comment client plus the first accepted server link.
pub async fn client() -> (CommentClient, MemoryServer, ServerLink) {
    let (connection, mut server) = connect(options());
    let link = accept(&mut server).await;
    (CommentClient::new(connection), server, link)
}

pub async fn accept(server: &mut MemoryServer) -> ServerLink {
    timeout(TIMEOUT, server.accept())
        .await
        .expect("client never opened a link")
        .expect("transport dropped")
}

/// Next frame with `event`, skipping anything else.
pub async fn expect_event(link: &mut ServerLink, event: &str) -> Frame {
    timeout(TIMEOUT, link.recv_event(event))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
        .unwrap_or_else(|| panic!("link closed while waiting for {event}"))
}

/// Next frame of any kind.
pub async fn expect_frame(link: &mut ServerLink) -> Frame {
    timeout(TIMEOUT, link.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("link closed")
}

/// Assert nothing arrives for a short while.
pub async fn expect_silence(link: &mut ServerLink) {
    if let Ok(Some(frame)) = timeout(Duration::from_millis(100), link.recv()).await {
        panic!("unexpected frame: {frame:?}");
    }
}

/// Answer the next join with `snapshot` and return the join frame.
pub async fn accept_join(link: &mut ServerLink, snapshot: Value) -> Frame {
    let join = expect_event(link, PHX_JOIN).await;
    assert!(link.reply_ok(&join, snapshot).await);
    join
}

pub fn empty_snapshot() -> Value {
    json!({"comments": []})
}

pub async fn wait_link(connection: &Connection, state: LinkState) {
    let mut rx = connection.watch_link_state();
    wait_for(&mut rx, state).await;
}

pub async fn wait_session(mut rx: watch::Receiver<SessionState>, state: SessionState) {
    wait_for(&mut rx, state).await;
}

async fn wait_for<T: PartialEq + Copy + std::fmt::Debug>(rx: &mut watch::Receiver<T>, want: T) {
    let got = *timeout(TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .expect("state sender dropped");
    assert_eq!(got, want);
}

/// Thread-safe list of everything a handler saw.
pub fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static)
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |item| sink.lock().push(item))
}

/// Poll until `cond` holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
