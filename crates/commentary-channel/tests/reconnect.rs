//! Link loss, rejoin, heartbeat and shutdown behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use commentary_channel::protocol::{HEARTBEAT_EVENT, PHOENIX_TOPIC, PHX_ERROR, PHX_JOIN};
use commentary_channel::{
    ChannelError, Connection, ConnectionError, Frame, LinkState, MemoryTransport, Operation,
    RejoinSnapshot, SessionState, SubscriptionRegistry,
};
use commentary_core::BackoffConfig;
use serde_json::{Value, json};
use tokio::time::timeout;

use common::{
    accept, accept_join, connect, empty_snapshot, eventually, expect_event, expect_frame,
    expect_silence, options, recorder, wait_link, wait_session,
};

// ── Transparent rejoin ──

#[tokio::test]
async fn dropped_link_rejoins_and_redelivers_snapshot() {
    let (connection, mut server) = connect(options());
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:42");
    let (events, record_event) = recorder::<Value>();
    let (resyncs, record_resync) = recorder::<Value>();
    let _ = session.on("comments:42:new", move |p| record_event(p.clone()));
    let _ = session.on_resync(move |p| record_resync(p.clone()));

    let (joined, first_join) =
        tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    joined.unwrap().start();

    let state = session.watch_state();
    drop(link);
    wait_session(state, SessionState::Joining).await;

    let mut link = accept(&mut server).await;
    let rejoin = expect_event(&mut link, PHX_JOIN).await;
    assert_eq!(rejoin.topic, "comments:42");
    assert_ne!(rejoin.join_ref, first_join.join_ref);
    let fresh = json!({"comments": [{"content": "missed"}]});
    assert!(link.reply_ok(&rejoin, fresh.clone()).await);

    eventually(|| resyncs.lock().len() == 1).await;
    assert_eq!(resyncs.lock()[0], fresh);
    assert_eq!(session.state(), SessionState::Joined);
    assert!(registry.get("comments:42").is_some_and(|s| s.same_session(&session)));

    assert!(link.broadcast("comments:42", "comments:42:new", json!(1)).await);
    eventually(|| events.lock().len() == 1).await;
}

#[tokio::test]
async fn suppressed_rejoin_snapshot_is_not_delivered() {
    let mut opts = options();
    opts.rejoin_snapshot = RejoinSnapshot::Suppress;
    let (connection, mut server) = connect(opts);
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:1");
    let (events, record_event) = recorder::<Value>();
    let (resyncs, record_resync) = recorder::<Value>();
    let _ = session.on("comments:1:new", move |p| record_event(p.clone()));
    let _ = session.on_resync(move |p| record_resync(p.clone()));
    let (joined, _) = tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    joined.unwrap().start();

    drop(link);
    let mut link = accept(&mut server).await;
    let _ = accept_join(&mut link, json!({"comments": [{"content": "x"}]})).await;
    assert!(link.broadcast("comments:1", "comments:1:new", json!(1)).await);

    eventually(|| events.lock().len() == 1).await;
    assert!(resyncs.lock().is_empty());
}

#[tokio::test]
async fn refused_rejoin_errors_the_session() {
    let (connection, mut server) = connect(options());
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:1");
    let (joined, _) = tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    joined.unwrap().start();

    let state = session.watch_state();
    drop(link);
    let mut link = accept(&mut server).await;
    let rejoin = expect_event(&mut link, PHX_JOIN).await;
    assert!(link.reply_error(&rejoin, json!({"reason": "gone"})).await);

    wait_session(state, SessionState::Errored).await;
    assert!(registry.get("comments:1").is_none());
    expect_silence(&mut link).await;
}

#[tokio::test]
async fn in_flight_push_fails_when_the_link_drops() {
    let (connection, mut server) = connect(options());
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:1");
    let (joined, _) = tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    joined.unwrap().start();

    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.push("comment:add", json!({"content": "a"})).await }
    });
    let _ = expect_event(&mut link, "comment:add").await;
    drop(link);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, ChannelError::Connection(ConnectionError::LinkLost));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn server_error_triggers_rejoin() {
    let (connection, mut server) = connect(options());
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:1");
    let (resyncs, record_resync) = recorder::<Value>();
    let _ = session.on_resync(move |p| record_resync(p.clone()));
    let (joined, join) = tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    joined.unwrap().start();

    // From an older channel: ignored.
    let mut stale = Frame::broadcast("comments:1", PHX_ERROR, json!({}));
    stale.join_ref = Some("999".into());
    assert!(link.send(&stale).await);

    let mut crashed = Frame::broadcast("comments:1", PHX_ERROR, json!({}));
    crashed.join_ref = join.join_ref.clone();
    assert!(link.send(&crashed).await);

    let rejoin = expect_event(&mut link, PHX_JOIN).await;
    assert_ne!(rejoin.join_ref, join.join_ref);
    assert_eq!(session.state(), SessionState::Joining);
    assert!(link.reply_ok(&rejoin, empty_snapshot()).await);

    eventually(|| resyncs.lock().len() == 1).await;
    assert_eq!(session.state(), SessionState::Joined);
}

#[tokio::test]
async fn raw_sends_queue_while_down_up_to_the_limit() {
    let (transport, mut server) = MemoryTransport::pair();
    server.reject_next(ConnectionError::Transport("down".into()));
    let mut opts = options();
    opts.max_queued_messages = 1;
    opts.reconnect = BackoffConfig {
        base_delay_ms: 50,
        max_delay_ms: 50,
        jitter_factor: 0.0,
    };
    let connection = Connection::connect(Arc::new(transport), opts).unwrap();

    let _ = connection.send("lobby", "ping", json!(1)).unwrap();
    let _ = connection.send("lobby", "ping", json!(2)).unwrap();

    let mut link = accept(&mut server).await;
    let frame = expect_frame(&mut link).await;
    assert_eq!(frame.topic, "lobby");
    assert_eq!(frame.payload, json!(1));
    assert_eq!(frame.join_ref, None);
    expect_silence(&mut link).await;
}

// ── Link state ──

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let (transport, server) = MemoryTransport::pair();
    server.reject_next(ConnectionError::Transport("down".into()));
    server.reject_next(ConnectionError::Transport("down".into()));
    let mut opts = options();
    opts.max_reconnect_attempts = Some(2);
    let connection = Connection::connect(Arc::new(transport), opts).unwrap();

    wait_link(&connection, LinkState::Errored).await;
    assert_eq!(server.opened_urls().len(), 2);

    let err = connection.send("comments:1", "ping", json!({})).unwrap_err();
    assert_eq!(err, ConnectionError::GaveUp { attempts: 2 });

    let registry = SubscriptionRegistry::new(connection);
    let err = registry.get_or_create("comments:1").join().await.unwrap_err();
    assert_eq!(
        err,
        ChannelError::Connection(ConnectionError::GaveUp { attempts: 2 })
    );
}

#[tokio::test]
async fn joined_sessions_error_when_reconnecting_gives_up() {
    let (transport, mut server) = MemoryTransport::pair();
    let mut opts = options();
    opts.max_reconnect_attempts = Some(1);
    let connection = Connection::connect(Arc::new(transport), opts).unwrap();
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:1");
    let (joined, _) = tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    joined.unwrap().start();

    server.reject_next(ConnectionError::Rejected { status: 403 });
    let state = session.watch_state();
    drop(link);

    wait_session(state, SessionState::Errored).await;
    wait_link(registry.connection(), LinkState::Errored).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn rejected_handshake_recovers_on_retry() {
    let (transport, mut server) = MemoryTransport::pair();
    server.reject_next(ConnectionError::Rejected { status: 403 });
    let connection =
        Connection::connect(Arc::new(transport), options().with_token("t0k3n")).unwrap();

    let mut link = accept(&mut server).await;
    wait_link(&connection, LinkState::Open).await;
    let urls = server.opened_urls();
    assert_eq!(urls.len(), 2);
    assert_eq!(
        urls[0].as_str(),
        "ws://memory.test/socket/websocket?token=t0k3n&vsn=2.0.0"
    );

    let registry = SubscriptionRegistry::new(connection);
    let session = registry.get_or_create("comments:1");
    let (joined, _) = tokio::join!(session.join(), accept_join(&mut link, empty_snapshot()));
    assert!(joined.is_ok());
}

// ── Heartbeat ──

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeat_reopens_the_link() {
    let mut opts = options();
    opts.heartbeat_interval = Some(Duration::from_secs(30));
    let (_connection, mut server) = connect(opts);
    let mut link = server.accept().await.unwrap();

    let beat = link.recv_event(HEARTBEAT_EVENT).await.unwrap();
    assert_eq!(beat.topic, PHOENIX_TOPIC);
    assert_eq!(beat.join_ref, None);

    // Never acknowledged: the next tick tears the link down.
    let _second = server.accept().await.unwrap();
    assert!(link.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn acknowledged_heartbeats_keep_the_link() {
    let mut opts = options();
    opts.heartbeat_interval = Some(Duration::from_secs(30));
    let (connection, mut server) = connect(opts);
    let mut link = server.accept().await.unwrap();

    let responder = tokio::spawn(async move {
        let mut beats = 0;
        while let Some(beat) = link.recv_event(HEARTBEAT_EVENT).await {
            assert!(link.reply_ok(&beat, json!({})).await);
            beats += 1;
        }
        beats
    });

    assert!(timeout(Duration::from_secs(300), server.accept()).await.is_err());
    assert_eq!(connection.link_state(), LinkState::Open);
    connection.disconnect().await;
    assert!(responder.await.unwrap() >= 9);
}

// ── Shutdown ──

#[tokio::test]
async fn disconnect_cancels_everything() {
    let (connection, mut server) = connect(options());
    let mut link = accept(&mut server).await;
    let registry = SubscriptionRegistry::new(connection.clone());

    let joined = registry.get_or_create("comments:1");
    let (result, _) = tokio::join!(joined.join(), accept_join(&mut link, empty_snapshot()));
    result.unwrap().start();
    let pending_push = tokio::spawn({
        let joined = joined.clone();
        async move { joined.push("comment:add", json!({"content": "a"})).await }
    });
    let _ = expect_event(&mut link, "comment:add").await;

    let joining = registry.get_or_create("comments:2");
    let pending_join = tokio::spawn({
        let joining = joining.clone();
        async move { joining.join().await }
    });
    let _ = expect_event(&mut link, PHX_JOIN).await;

    connection.disconnect().await;

    assert_matches!(
        pending_push.await.unwrap(),
        Err(ChannelError::Cancelled {
            operation: Operation::Push,
            ..
        })
    );
    assert_matches!(
        pending_join.await.unwrap(),
        Err(ChannelError::Cancelled {
            operation: Operation::Join,
            ..
        })
    );
    assert_eq!(joined.state(), SessionState::Left);
    assert_eq!(joining.state(), SessionState::Left);
    assert_eq!(connection.link_state(), LinkState::Closed);
    assert!(connection.is_shut_down());
    assert!(timeout(Duration::from_secs(1), link.recv()).await.unwrap().is_none());

    let err = connection.send("comments:1", "x", json!({})).unwrap_err();
    assert_eq!(err, ConnectionError::Closed);
}
