//! Deadlines, cancellation, connection loss and shutdown

mod common;

use bytes::Bytes;
use common::*;
use prost::Message;
use std::time::Duration;
use strand_client::{
    BackoffConfig, CallContext, CallOptions, Client, Code, ConnectivityState,
    TransientFailurePolicy,
};
use strand_core::Signal;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn slow_request() -> Bytes {
    Bytes::from(Count { value: 1 }.encode_to_vec())
}

fn fast_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig::new()
        .max_attempts(max_attempts)
        .initial_backoff(Duration::from_millis(20))
        .max_backoff(Duration::from_millis(50))
        .jitter(0.0)
}

#[tokio::test]
async fn test_expired_deadline_never_connects() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let options = CallOptions::new().deadline(Instant::now() - Duration::from_millis(5));
    let err = client
        .unary::<_, HelloReply>(&SAY_HELLO, &HelloRequest::default(), options)
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(connector.connect_attempts(), 0);
    assert_eq!(client.channel().state(), ConnectivityState::Idle);
}

#[tokio::test]
async fn test_deadline_exceeded_while_waiting() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let started = Instant::now();
    let err = client
        .unary::<_, Count>(
            &SLOW,
            &Count { value: 1 },
            CallOptions::new().timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.channel().active_calls(), 0);
}

#[tokio::test]
async fn test_channel_default_timeout() {
    let connector = spawn_server();
    let channel = builder(&connector)
        .default_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let client = Client::new(channel);

    let err = client
        .unary::<_, Count>(&SLOW, &Count { value: 1 }, CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_timeout_reaches_server() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let left: Count = client
        .unary(
            &TIME_LEFT,
            &Count::default(),
            CallOptions::new().timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert!(left.value > 0 && left.value <= 30_000);

    let left: Count = client
        .unary(&TIME_LEFT, &Count::default(), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(left.value, -1);
}

#[tokio::test]
async fn test_max_timeout_means_no_deadline() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let reply: HelloReply = client
        .unary(
            &SAY_HELLO,
            &HelloRequest {
                name: "World".into(),
            },
            CallOptions::new().timeout(Duration::MAX),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "Hello World");

    let left: Count = client
        .unary(
            &TIME_LEFT,
            &Count::default(),
            CallOptions::new().timeout(Duration::MAX),
        )
        .await
        .unwrap();
    assert_eq!(left.value, -1);
}

#[tokio::test]
async fn test_cancel_call() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let call = client.start(&SLOW, CallOptions::new());
    call.send(slow_request()).await.unwrap();
    call.cancel();

    assert_eq!(call.status().await.code(), Code::Cancelled);
    assert_eq!(client.channel().active_calls(), 0);
}

#[tokio::test]
async fn test_dropped_call_is_cancelled() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let call = client.start(&SLOW, CallOptions::new());
    call.send(slow_request()).await.unwrap();
    assert_eq!(client.channel().active_calls(), 1);

    drop(call);
    assert_eq!(client.channel().active_calls(), 0);
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Option<Signal>>) -> Option<Signal> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("server event in time")
        .expect("server still running")
}

#[tokio::test]
async fn test_cancel_resets_server_call() {
    let (connector, mut events) = spawn_recording_signals();
    let client = Client::new(channel(&connector));

    let call = client.start(&PARK, CallOptions::new());
    call.send(slow_request()).await.unwrap();
    assert_eq!(next_event(&mut events).await, None);

    call.cancel();
    assert_eq!(next_event(&mut events).await, Some(Signal::Cancelled));
}

#[tokio::test]
async fn test_dropped_call_resets_server_call() {
    let (connector, mut events) = spawn_recording_signals();
    let client = Client::new(channel(&connector));

    let call = client.start(&PARK, CallOptions::new());
    call.send(slow_request()).await.unwrap();
    assert_eq!(next_event(&mut events).await, None);

    drop(call);
    assert_eq!(next_event(&mut events).await, Some(Signal::Cancelled));

    // The connection stays up for other calls.
    let reply: HelloReply = client
        .unary(
            &SAY_HELLO,
            &HelloRequest {
                name: "still here".into(),
            },
            CallOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "Hello still here");
}

#[tokio::test]
async fn test_parent_cancellation_propagates() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));
    let parent = CallContext::background().with_cancel();

    let call = client.start(&SLOW, CallOptions::new().parent(&parent));
    call.send(slow_request()).await.unwrap();
    parent.cancel();

    assert_eq!(call.status().await.code(), Code::Cancelled);
}

#[tokio::test]
async fn test_parent_deadline_propagates() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));
    let parent = CallContext::background().with_timeout(Duration::from_millis(100));

    let err = client
        .unary::<_, Count>(&SLOW, &Count { value: 1 }, CallOptions::new().parent(&parent))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_propagation_disabled_ignores_parent() {
    let connector = spawn_server();
    let channel = builder(&connector)
        .enable_call_context_propagation(false)
        .build()
        .unwrap();
    let client = Client::new(channel);
    let parent = CallContext::background().with_cancel();

    let call = client.start(
        &SLOW,
        CallOptions::new()
            .parent(&parent)
            .timeout(Duration::from_millis(200)),
    );
    call.send(slow_request()).await.unwrap();
    parent.cancel();

    // Only the call's own deadline ends it.
    assert_eq!(call.status().await.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_cancelling_call_leaves_parent_intact() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));
    let parent = CallContext::background().with_cancel();

    let call = client.start(&SLOW, CallOptions::new().parent(&parent));
    call.send(slow_request()).await.unwrap();
    call.cancel();

    assert_eq!(call.status().await.code(), Code::Cancelled);
    assert!(!parent.is_done());
}

#[tokio::test]
async fn test_connection_loss_fails_calls_then_recovers() {
    init_tracing();
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let call = client.start(&SLOW, CallOptions::new());
    call.send(slow_request()).await.unwrap();
    let channel = client.channel().clone();
    eventually(|| channel.state() == ConnectivityState::Ready).await;

    connector.sever_all();
    let status = call.status().await;
    assert_eq!(status.code(), Code::Unavailable);
    eventually(|| channel.state() == ConnectivityState::Idle).await;

    let reply: HelloReply = client
        .unary(
            &SAY_HELLO,
            &HelloRequest {
                name: "again".into(),
            },
            CallOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "Hello again");
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn test_close_fails_every_outstanding_call() {
    let connector = spawn_server();
    let client = Client::new(channel(&connector));

    let mut calls = Vec::new();
    for _ in 0..3 {
        let call = client.start(&SLOW, CallOptions::new());
        call.send(slow_request()).await.unwrap();
        calls.push(call);
    }
    assert_eq!(client.channel().active_calls(), 3);

    client.channel().close().await;

    let mut unavailable = 0;
    for call in &calls {
        if call.status().await.code() == Code::Unavailable {
            unavailable += 1;
        }
    }
    assert_eq!(unavailable, 3);
    assert_eq!(client.channel().state(), ConnectivityState::Shutdown);

    let err = client
        .unary::<_, HelloReply>(&SAY_HELLO, &HelloRequest::default(), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn test_close_unused_channel() {
    let connector = spawn_server();
    let channel = channel(&connector);

    channel.close().await;
    assert_eq!(channel.state(), ConnectivityState::Shutdown);
    assert_eq!(connector.connect_attempts(), 0);
    assert!(channel.connect().is_err());
}

#[tokio::test]
async fn test_explicit_connect() {
    let connector = spawn_server();
    let channel = channel(&connector);
    assert_eq!(channel.state(), ConnectivityState::Idle);

    channel.connect().unwrap();
    let mut state = channel.state();
    while state != ConnectivityState::Ready {
        state = channel.wait_for_state_change(state).await;
        assert_ne!(state, ConnectivityState::Shutdown);
    }
    assert_eq!(connector.connect_attempts(), 1);
}

#[tokio::test]
async fn test_queued_call_waits_for_reconnect() {
    let connector = spawn_server();
    connector.set_refusing(true);
    let channel = builder(&connector)
        .reconnect_backoff(fast_backoff(50))
        .build()
        .unwrap();
    let client = Client::new(channel);

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .unary::<_, HelloReply>(
                    &SAY_HELLO,
                    &HelloRequest {
                        name: "later".into(),
                    },
                    CallOptions::new(),
                )
                .await
        }
    });

    eventually(|| connector.connect_attempts() >= 2).await;
    connector.set_refusing(false);

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.message, "Hello later");
    assert_eq!(client.channel().state(), ConnectivityState::Ready);
}

#[tokio::test]
async fn test_attempts_exhausted_fails_pending_and_goes_idle() {
    init_tracing();
    let connector = spawn_server();
    connector.set_refusing(true);
    let channel = builder(&connector)
        .reconnect_backoff(fast_backoff(3))
        .build()
        .unwrap();
    let client = Client::new(channel);

    let err = client
        .unary::<_, HelloReply>(&SAY_HELLO, &HelloRequest::default(), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(connector.connect_attempts(), 3);

    let channel = client.channel().clone();
    eventually(|| channel.state() == ConnectivityState::Idle).await;
}

#[tokio::test]
async fn test_fail_fast_policy() {
    let connector = spawn_server();
    connector.set_refusing(true);
    let channel = builder(&connector)
        .reconnect_backoff(
            fast_backoff(50)
                .initial_backoff(Duration::from_secs(5))
                .max_backoff(Duration::from_secs(5)),
        )
        .transient_failure_policy(TransientFailurePolicy::FailFast)
        .build()
        .unwrap();
    let client = Client::new(channel);

    let err = client
        .unary::<_, HelloReply>(&SAY_HELLO, &HelloRequest::default(), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(connector.connect_attempts(), 1);
    assert_eq!(client.channel().state(), ConnectivityState::TransientFailure);

    // New calls fail immediately while the channel backs off.
    let err = client
        .unary::<_, HelloReply>(&SAY_HELLO, &HelloRequest::default(), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(connector.connect_attempts(), 1);
}

#[tokio::test]
async fn test_pending_call_limit() {
    let connector = spawn_server();
    connector.set_refusing(true);
    let channel = builder(&connector)
        .reconnect_backoff(fast_backoff(50))
        .max_pending_calls(1)
        .build()
        .unwrap();
    let client = Client::new(channel);

    let first = client.start(&SAY_HELLO, CallOptions::new());
    let second = client.start(&SAY_HELLO, CallOptions::new());

    let status = second.status().await;
    assert_eq!(status.code(), Code::Unavailable);
    assert!(first.try_status().is_none());

    client.channel().close().await;
    assert_eq!(first.status().await.code(), Code::Unavailable);
}
