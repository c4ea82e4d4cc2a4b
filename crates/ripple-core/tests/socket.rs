//! End-to-end engine tests over the in-memory mock transport.
//!
//! Each test drives the socket exactly like an application would and plays
//! the server side by hand: reading the frames the engine writes and
//! injecting replies and events. Timer-sensitive tests run with paused
//! virtual time.

use std::sync::Arc;
use std::time::Duration;

use ripple_core::{
    Backoff, Channel, ChannelConfig, ChannelState, PresenceUpdate, Socket, SocketConfig,
    SocketError, SocketStatus, StaticToken,
};
use ripple_protocol::{events, Envelope, EnvelopeCodec, WireFormat, WireMessage, CONTROL_TOPIC};
use ripple_transport::mock::{MockLink, MockServer, MockTransport};
use serde_json::{json, Value};

fn codec() -> EnvelopeCodec {
    EnvelopeCodec::new(WireFormat::Json)
}

/// Config with deterministic backoff and heartbeats far out of the way;
/// tests about heartbeats override the interval.
fn test_config() -> SocketConfig {
    SocketConfig::default()
        .with_heartbeat_interval(Duration::from_secs(600))
        .with_default_push_timeout(Duration::from_secs(5))
        .with_backoff(Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.0,
        })
}

fn new_socket(config: SocketConfig) -> (Socket, MockServer) {
    // Visible with `cargo test -- --nocapture`; RUST_LOG filters apply.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (transport, server) = MockTransport::pair();
    let socket = Socket::new(
        "mock://socket",
        config,
        Arc::new(transport),
        Arc::new(StaticToken::none()),
    );
    (socket, server)
}

async fn connected_socket() -> (Socket, MockServer, MockLink) {
    let (socket, mut server) = new_socket(test_config());
    socket.connect().await.unwrap();
    let link = server.accept().await;
    (socket, server, link)
}

fn decode(message: WireMessage) -> Envelope {
    codec().decode(&message).unwrap()
}

/// Read frames until one matches the given event.
async fn recv_event(link: &mut MockLink, event: &str) -> Envelope {
    loop {
        let message = link.recv().await.expect("link closed while waiting");
        let envelope = decode(message);
        if envelope.event == event {
            return envelope;
        }
    }
}

fn reply(request: &Envelope, status: &str, response: Value) -> WireMessage {
    let envelope = Envelope {
        topic: request.topic.clone(),
        event: events::REPLY.to_string(),
        payload: json!({"status": status, "response": response}),
        reference: request.reference.clone(),
        join_ref: request.join_ref.clone(),
    };
    codec().encode(&envelope).unwrap()
}

fn reply_ok(request: &Envelope, response: Value) -> WireMessage {
    reply(request, "ok", response)
}

fn event(topic: &str, event: &str, payload: Value) -> WireMessage {
    codec()
        .encode(&Envelope::new(topic, event, payload))
        .unwrap()
}

/// Create a channel and complete its join handshake.
async fn joined_channel(
    socket: &Socket,
    link: &mut MockLink,
    topic: &str,
    config: ChannelConfig,
) -> Channel {
    let channel = socket.channel(topic, config).await.unwrap();
    let join = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });
    let request = recv_event(link, events::JOIN).await;
    link.send(reply_ok(&request, json!({})));
    join.await.unwrap().unwrap();
    channel
}

fn generation(envelope: &Envelope) -> u64 {
    envelope
        .join_ref
        .as_deref()
        .and_then(|j| j.parse().ok())
        .expect("join_ref missing")
}

// ── Join ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn join_round_trip() -> anyhow::Result<()> {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = socket
        .channel(
            "room:lobby",
            ChannelConfig::default().with_params(json!({"since": 7})),
        )
        .await?;

    let join = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });

    let request = recv_event(&mut link, events::JOIN).await;
    assert_eq!(request.topic, "room:lobby");
    assert!(request.reference.is_some());
    assert!(request.join_ref.is_some());
    assert_eq!(request.payload["params"]["since"], 7);

    link.send(reply_ok(&request, json!({"history": []})));

    let response = join.await??;
    assert_eq!(response["history"], json!([]));
    assert_eq!(channel.state().await?, ChannelState::Joined);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn join_rejection_surfaces_to_caller() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = socket
        .channel("room:private", ChannelConfig::default())
        .await
        .unwrap();

    let join = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });

    let request = recv_event(&mut link, events::JOIN).await;
    link.send(reply(&request, "error", json!({"reason": "unauthorized"})));

    match join.await.unwrap() {
        Err(SocketError::JoinRejected(response)) => {
            assert_eq!(response["reason"], "unauthorized");
        }
        other => panic!("expected JoinRejected, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_joins_share_one_in_flight_result() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = socket
        .channel("room:lobby", ChannelConfig::default())
        .await
        .unwrap();

    let first = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });
    let second = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });

    let request = recv_event(&mut link, events::JOIN).await;

    // Give the second caller time to register: still no second frame.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(link.try_recv().is_none(), "second join frame was sent");

    link.send(reply_ok(&request, json!({"seat": 1})));

    assert_eq!(first.await.unwrap().unwrap()["seat"], 1);
    assert_eq!(second.await.unwrap().unwrap()["seat"], 1);
}

#[tokio::test(start_paused = true)]
async fn join_without_connection_fails_then_rejoins_on_connect() {
    let (socket, mut server) = new_socket(test_config());
    let channel = socket
        .channel("room:lobby", ChannelConfig::default())
        .await
        .unwrap();

    match channel.join().await {
        Err(SocketError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }

    // The failed channel is picked up automatically once connected.
    socket.connect().await.unwrap();
    let mut link = server.accept().await;
    let request = recv_event(&mut link, events::JOIN).await;
    link.send(reply_ok(&request, Value::Null));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.state().await.unwrap(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn join_timeout_is_surfaced() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = socket
        .channel("room:lobby", ChannelConfig::default())
        .await
        .unwrap();

    let join = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });
    let _request = recv_event(&mut link, events::JOIN).await;

    // Never replied: the join push times out.
    match join.await.unwrap() {
        Err(SocketError::PushTimeout) => {}
        other => panic!("expected PushTimeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn channel_topics_are_unique_per_socket() {
    let (socket, _server, mut link) = connected_socket().await;
    let first = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    // Second request for the topic aliases the same channel.
    let second = socket
        .channel("room:lobby", ChannelConfig::default())
        .await
        .unwrap();
    assert_eq!(second.state().await.unwrap(), ChannelState::Joined);
    assert_eq!(first.topic(), second.topic());
}

// ── Push and broadcast ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn push_resolves_with_server_reply() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", json!({"body": "hi"})).await }
    });

    let request = recv_event(&mut link, "shout").await;
    assert_eq!(request.payload["body"], "hi");
    assert!(request.reference.is_some());
    link.send(reply_ok(&request, json!({"delivered": true})));

    assert_eq!(push.await.unwrap().unwrap()["delivered"], true);
}

#[tokio::test(start_paused = true)]
async fn distinct_pushes_resolve_independently() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let first = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("first", Value::Null).await }
    });
    let request_one = recv_event(&mut link, "first").await;

    let second = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("second", Value::Null).await }
    });
    let request_two = recv_event(&mut link, "second").await;

    assert_ne!(request_one.reference, request_two.reference);

    // Replies out of order: no head-of-line blocking.
    link.send(reply_ok(&request_two, json!(2)));
    assert_eq!(second.await.unwrap().unwrap(), json!(2));
    link.send(reply_ok(&request_one, json!(1)));
    assert_eq!(first.await.unwrap().unwrap(), json!(1));
}

#[tokio::test(start_paused = true)]
async fn broadcast_without_ack_resolves_without_reply() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    // No server interaction at all past the write.
    let response = channel.broadcast("shout", json!({"body": "hi"})).await.unwrap();
    assert_eq!(response, Value::Null);

    let request = recv_event(&mut link, "shout").await;
    assert_eq!(request.payload["body"], "hi");
}

#[tokio::test(start_paused = true)]
async fn broadcast_with_ack_waits_for_reply() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(
        &socket,
        &mut link,
        "room:lobby",
        ChannelConfig::default().with_ack_broadcasts(true),
    )
    .await;

    let broadcast = tokio::spawn({
        let channel = channel.clone();
        async move { channel.broadcast("shout", json!({"body": "hi"})).await }
    });

    let request = recv_event(&mut link, "shout").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!broadcast.is_finished(), "broadcast resolved without ack");

    link.send(reply_ok(&request, json!({"acked": true})));
    assert_eq!(broadcast.await.unwrap().unwrap()["acked"], true);
}

#[tokio::test(start_paused = true)]
async fn push_timeout_resolves_once_and_late_reply_is_noop() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .push_with_timeout("shout", Value::Null, Duration::from_secs(1))
                .await
        }
    });
    let request = recv_event(&mut link, "shout").await;

    match push.await.unwrap() {
        Err(SocketError::PushTimeout) => {}
        other => panic!("expected PushTimeout, got {other:?}"),
    }

    // The reply loses the race; nothing resolves twice and the channel
    // keeps working.
    link.send(reply_ok(&request, json!({"too": "late"})));

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("again", Value::Null).await }
    });
    let request = recv_event(&mut link, "again").await;
    link.send(reply_ok(&request, json!({"fresh": true})));
    assert_eq!(push.await.unwrap().unwrap()["fresh"], true);
}

#[tokio::test(start_paused = true)]
async fn push_on_unjoined_channel_fails_without_network() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = socket
        .channel("room:lobby", ChannelConfig::default())
        .await
        .unwrap();

    match channel.push("shout", Value::Null).await {
        Err(SocketError::ChannelUnavailable { topic, state }) => {
            assert_eq!(topic, "room:lobby");
            assert_eq!(state, ChannelState::Closed);
        }
        other => panic!("expected ChannelUnavailable, got {other:?}"),
    }
    assert!(link.try_recv().is_none(), "frame sent for unavailable channel");
}

#[tokio::test(start_paused = true)]
async fn pushes_buffered_while_joining_flush_under_new_generation() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = socket
        .channel("room:lobby", ChannelConfig::default())
        .await
        .unwrap();

    let join = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join().await }
    });
    let join_request = recv_event(&mut link, events::JOIN).await;

    // Sent while the join is still pending: buffered, nothing on the wire.
    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", json!({"queued": true})).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(link.try_recv().is_none(), "buffered push hit the wire early");

    link.send(reply_ok(&join_request, Value::Null));
    join.await.unwrap().unwrap();

    let flushed = recv_event(&mut link, "shout").await;
    assert_eq!(flushed.join_ref, join_request.join_ref);
    link.send(reply_ok(&flushed, json!({"ok": 1})));
    assert_eq!(push.await.unwrap().unwrap()["ok"], 1);
}

// ── Generations ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stale_generation_reply_is_discarded() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", Value::Null).await }
    });
    let request = recv_event(&mut link, "shout").await;
    let old_generation = request.join_ref.clone();

    // Server-side channel error forces a rejoin with a fresh generation.
    link.send(event("room:lobby", events::ERROR, Value::Null));
    let rejoin = recv_event(&mut link, events::JOIN).await;
    assert!(generation(&rejoin) > old_generation.as_deref().unwrap().parse().unwrap());
    link.send(reply_ok(&rejoin, Value::Null));

    // Reply addressed to the superseded generation: silently dropped, so
    // the push runs into its timeout instead of resolving ok.
    let stale = Envelope {
        topic: request.topic.clone(),
        event: events::REPLY.to_string(),
        payload: json!({"status": "ok", "response": {"stale": true}}),
        reference: request.reference.clone(),
        join_ref: old_generation,
    };
    link.send(codec().encode(&stale).unwrap());

    match push.await.unwrap() {
        Err(SocketError::PushTimeout) => {}
        other => panic!("expected PushTimeout, got {other:?}"),
    }
}

// ── Leave ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn leave_closes_channel_and_resolves_outstanding_pushes() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", Value::Null).await }
    });
    let _shout = recv_event(&mut link, "shout").await;

    let leave = tokio::spawn({
        let channel = channel.clone();
        async move { channel.leave().await }
    });
    let request = recv_event(&mut link, events::LEAVE).await;

    match push.await.unwrap() {
        Err(SocketError::ChannelLeft) => {}
        other => panic!("expected ChannelLeft, got {other:?}"),
    }

    link.send(reply_ok(&request, Value::Null));
    leave.await.unwrap().unwrap();

    // The channel is gone from the registry.
    match channel.push("shout", Value::Null).await {
        Err(SocketError::ChannelUnavailable { .. }) => {}
        other => panic!("expected ChannelUnavailable, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn server_close_event_tears_channel_down() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    link.send(event("room:lobby", events::CLOSE, Value::Null));
    tokio::time::sleep(Duration::from_millis(10)).await;

    match channel.state().await {
        Err(SocketError::ChannelUnavailable { .. }) => {}
        other => panic!("expected removed channel, got {other:?}"),
    }
}

// ── Reconnection ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transport_loss_reconnects_and_rejoins_with_greater_generation() {
    let (socket, mut server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", Value::Null).await }
    });
    let request = recv_event(&mut link, "shout").await;
    let old_generation = generation(&request);

    link.disconnect();

    // Outstanding pushes resolve with the connection loss.
    match push.await.unwrap() {
        Err(SocketError::ConnectionLost) => {}
        other => panic!("expected ConnectionLost, got {other:?}"),
    }

    // One reconnect cycle, then an automatic rejoin on a new generation.
    let mut link = server.accept().await;
    assert_eq!(server.connect_attempts(), 2);

    let rejoin = recv_event(&mut link, events::JOIN).await;
    assert!(generation(&rejoin) > old_generation);
    link.send(reply_ok(&rejoin, Value::Null));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.state().await.unwrap(), ChannelState::Joined);
    assert_eq!(socket.status().await.unwrap(), SocketStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_retries_with_backoff_until_success() {
    let (socket, mut server, mut link) = connected_socket().await;
    joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    server.fail_next_connects(2);
    link.disconnect();

    // Attempts: initial connect + 2 failures + 1 success.
    let mut link = server.accept().await;
    assert_eq!(server.connect_attempts(), 4);

    let rejoin = recv_event(&mut link, events::JOIN).await;
    link.send(reply_ok(&rejoin, Value::Null));
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_final_and_resolves_outstanding() {
    let (socket, server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", Value::Null).await }
    });
    let _request = recv_event(&mut link, "shout").await;

    socket.disconnect("going away").await.unwrap();

    match push.await.unwrap() {
        Err(SocketError::ConnectionLost) => {}
        other => panic!("expected ConnectionLost, got {other:?}"),
    }
    assert_eq!(socket.status().await.unwrap(), SocketStatus::Disconnected);

    // No reconnect attempts, ever.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.connect_attempts(), 1);
}

// ── Heartbeat ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeats_force_exactly_one_reconnect() {
    let config = test_config()
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_heartbeat_max_missed(2);
    let (socket, mut server) = new_socket(config);
    socket.connect().await.unwrap();
    let mut link = server.accept().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let heartbeat = recv_event(&mut link, events::HEARTBEAT).await;
    assert_eq!(heartbeat.topic, CONTROL_TOPIC);
    assert!(heartbeat.reference.is_some());

    // Never answered: the connection is declared dead and a single
    // reconnect cycle begins, rejoining the channel on a new generation.
    let mut link = server.accept().await;
    assert_eq!(server.connect_attempts(), 2);

    let rejoin = recv_event(&mut link, events::JOIN).await;
    assert!(generation(&rejoin) > 1);
    link.send(reply_ok(&rejoin, Value::Null));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.state().await.unwrap(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeats_keep_the_connection_alive() {
    let config = test_config()
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_heartbeat_max_missed(2);
    let (socket, mut server) = new_socket(config);
    socket.connect().await.unwrap();
    let mut link = server.accept().await;

    for _ in 0..5 {
        let heartbeat = recv_event(&mut link, events::HEARTBEAT).await;
        link.send(reply_ok(&heartbeat, Value::Null));
    }

    assert_eq!(socket.status().await.unwrap(), SocketStatus::Connected);
    assert_eq!(server.connect_attempts(), 1);
}

// ── Events and presence ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscriptions_receive_in_order_and_off_is_observable() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let mut first = channel.on("shout").await.unwrap();
    let mut second = channel.on("shout").await.unwrap();

    link.send(event("room:lobby", "shout", json!(1)));
    link.send(event("room:lobby", "shout", json!(2)));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(first.next().await, Some(json!(1)));
    assert_eq!(first.next().await, Some(json!(2)));
    assert_eq!(second.next().await, Some(json!(1)));
    assert_eq!(second.next().await, Some(json!(2)));

    // Removal shrinks the registry: only the surviving subscription sees
    // further events.
    assert!(channel.off(first.id()).await.unwrap());
    link.send(event("room:lobby", "shout", json!(3)));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(first.try_next(), None);
    assert_eq!(second.try_next(), Some(json!(3)));
}

#[tokio::test(start_paused = true)]
async fn unmatched_events_are_not_delivered() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let mut subscription = channel.on("shout").await.unwrap();
    link.send(event("room:lobby", "whisper", json!("psst")));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(subscription.try_next(), None);
}

#[tokio::test(start_paused = true)]
async fn presence_state_and_diffs_flow_to_subscribers() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(
        &socket,
        &mut link,
        "room:lobby",
        ChannelConfig::default().with_presence("user:1"),
    )
    .await;
    let mut updates = channel.on_presence().await.unwrap();

    let meta = json!({"device": "phone"});

    // Full state replaces the map wholesale.
    link.send(event(
        "room:lobby",
        events::PRESENCE_STATE,
        json!({"u1": [meta.clone()]}),
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(updates.next().await, Some(PresenceUpdate::Sync(_))));
    assert_eq!(
        channel.presence().await.unwrap().get("u1"),
        Some(&vec![meta.clone()])
    );

    // Diff adds a key; subscribers see that diff's entries only.
    link.send(event(
        "room:lobby",
        events::PRESENCE_DIFF,
        json!({"joins": {"u2": [{"device": "web"}]}, "leaves": {}}),
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;
    match updates.next().await {
        Some(PresenceUpdate::Diff(diff)) => {
            assert!(diff.joins.contains_key("u2"));
            assert!(diff.leaves.is_empty());
        }
        other => panic!("expected diff update, got {other:?}"),
    }
    assert_eq!(channel.presence().await.unwrap().len(), 2);

    // Diff removing the last meta deletes the key.
    link.send(event(
        "room:lobby",
        events::PRESENCE_DIFF,
        json!({"joins": {}, "leaves": {"u1": [meta]}}),
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let presence = channel.presence().await.unwrap();
    assert!(!presence.contains_key("u1"));
    assert!(presence.contains_key("u2"));
}

#[tokio::test(start_paused = true)]
async fn track_and_untrack_push_presence_events() -> anyhow::Result<()> {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(
        &socket,
        &mut link,
        "room:lobby",
        ChannelConfig::default().with_presence("user:1"),
    )
    .await;

    let track = tokio::spawn({
        let channel = channel.clone();
        async move { channel.track(json!({"status": "online"})).await }
    });
    let request = recv_event(&mut link, events::PRESENCE_TRACK).await;
    assert_eq!(request.payload["key"], "user:1");
    assert_eq!(request.payload["meta"]["status"], "online");
    link.send(reply_ok(&request, Value::Null));
    track.await??;

    let untrack = tokio::spawn({
        let channel = channel.clone();
        async move { channel.untrack().await }
    });
    let request = recv_event(&mut link, events::PRESENCE_UNTRACK).await;
    assert_eq!(request.payload["key"], "user:1");
    link.send(reply_ok(&request, Value::Null));
    untrack.await??;
    Ok(())
}

// ── Robustness ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_killing_the_connection() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    link.send(WireMessage::Text("not an envelope".into()));
    link.send(WireMessage::Text("[1, 2".into()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Still connected and fully functional.
    assert_eq!(socket.status().await.unwrap(), SocketStatus::Connected);
    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", Value::Null).await }
    });
    let request = recv_event(&mut link, "shout").await;
    link.send(reply_ok(&request, json!({"fine": true})));
    assert_eq!(push.await.unwrap().unwrap()["fine"], true);
}

#[tokio::test(start_paused = true)]
async fn duplicate_replies_resolve_only_once() {
    let (socket, _server, mut link) = connected_socket().await;
    let channel = joined_channel(&socket, &mut link, "room:lobby", ChannelConfig::default()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("shout", Value::Null).await }
    });
    let request = recv_event(&mut link, "shout").await;

    link.send(reply_ok(&request, json!({"first": true})));
    link.send(reply_ok(&request, json!({"second": true})));

    // First resolution wins; the duplicate is dropped on the floor.
    assert_eq!(push.await.unwrap().unwrap()["first"], true);
}
