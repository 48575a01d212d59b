//! Test service shared by the integration tests

#![allow(dead_code)]

use std::time::Duration;
use strand_client::{Channel, ChannelBuilder, MethodDescriptor, Status, StreamingShape};
use strand_server::{RequestStream, Router, Server};
use strand_core::Signal;
use strand_transport::{memory_endpoint, MemoryConnector};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Count {
    #[prost(int64, tag = "1")]
    pub value: i64,
}

pub const SAY_HELLO: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "SayHello", StreamingShape::Unary);
pub const SAY_HELLO_STREAM: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "SayHelloStream", StreamingShape::ServerStreaming);
pub const COUNT: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "Count", StreamingShape::ClientStreaming);
pub const CHAT: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "Chat", StreamingShape::BidiStreaming);
pub const SEQUENCE: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "Sequence", StreamingShape::ServerStreaming);
/// Answers only after a minute; used to hold calls open
pub const SLOW: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "Slow", StreamingShape::Unary);
/// Replies with the `authorization` metadata of the call
pub const WHO_AM_I: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "WhoAmI", StreamingShape::Unary);
/// Replies with the caller's remaining time in milliseconds, or -1
pub const TIME_LEFT: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "TimeLeft", StreamingShape::Unary);
/// Parks until the server-side context fires
pub const PARK: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "Park", StreamingShape::Unary);
pub const MISSING: MethodDescriptor =
    MethodDescriptor::new("greet.v1.Greeter", "Missing", StreamingShape::Unary);

pub fn router() -> Router {
    let mut router = Router::new();

    router.register_unary(&SAY_HELLO, |_ctx, req: HelloRequest| async move {
        Ok::<_, Status>(HelloReply {
            message: format!("Hello {}", req.name),
        })
    });

    router.register_server_streaming(&SAY_HELLO_STREAM, |_ctx, req: HelloRequest| async move {
        let reply = HelloReply {
            message: format!("Hello {}", req.name),
        };
        let replies: Vec<Result<HelloReply, Status>> = vec![Ok(reply); 3];
        Ok::<_, Status>(tokio_stream::iter(replies))
    });

    router.register_client_streaming(&COUNT, |_ctx, mut requests: RequestStream<Count>| async move {
        let mut total = 0;
        while let Some(count) = requests.message().await? {
            total += count.value;
        }
        Ok::<_, Status>(Count { value: total })
    });

    router.register_bidi_streaming(&CHAT, |_ctx, requests: RequestStream<HelloRequest>| async move {
        Ok::<_, Status>(requests.map(|request| {
            request.map(|req| HelloReply {
                message: format!("echo: {}", req.name),
            })
        }))
    });

    router.register_server_streaming(&SEQUENCE, |_ctx, req: Count| async move {
        let items: Vec<Result<Count, Status>> = (0..req.value).map(|value| Ok(Count { value })).collect();
        Ok::<_, Status>(tokio_stream::iter(items))
    });

    router.register_unary(&SLOW, |_ctx, req: Count| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, Status>(req)
    });

    router.register_unary(&WHO_AM_I, |ctx, _req: HelloRequest| async move {
        Ok::<_, Status>(HelloReply {
            message: ctx.metadata().get("authorization").unwrap_or("anonymous").to_string(),
        })
    });

    router.register_unary(&TIME_LEFT, |ctx, _req: Count| async move {
        let value = ctx.remaining().map(|d| d.as_millis() as i64).unwrap_or(-1);
        Ok::<_, Status>(Count { value })
    });

    router
}

/// Serve the test router on an in-process endpoint
pub fn spawn_server() -> MemoryConnector {
    spawn_with(Server::new(router()))
}

/// Serve the test router plus `PARK`.
///
/// Each `PARK` call reports `None` once its handler runs and `Some(signal)`
/// when its context fires.
pub fn spawn_recording_signals() -> (MemoryConnector, mpsc::UnboundedReceiver<Option<Signal>>) {
    let (events, rx) = mpsc::unbounded_channel();
    let mut router = router();
    router.register_unary(&PARK, move |ctx, req: Count| {
        let events = events.clone();
        async move {
            let fired = events.clone();
            ctx.context().on_signal(move |signal| {
                let _ = fired.send(Some(signal));
            });
            let _ = events.send(None);
            std::future::pending::<()>().await;
            Ok::<_, Status>(req)
        }
    });
    (spawn_with(Server::new(router)), rx)
}

pub fn spawn_with(server: Server) -> MemoryConnector {
    let (connector, listener) = memory_endpoint(64 * 1024);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    connector
}

pub fn builder(connector: &MemoryConnector) -> ChannelBuilder {
    Channel::builder().connector(connector.clone())
}

pub fn channel(connector: &MemoryConnector) -> Channel {
    builder(connector).build().unwrap()
}

/// Route test logs through the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or a few seconds have passed
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
