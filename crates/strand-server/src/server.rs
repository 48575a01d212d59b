//! Strand server implementation
//!
//! One task reads frames from each connection and routes them to per-call
//! handler tasks. Every outgoing frame goes through a single writer task so
//! frames of concurrent calls never interleave.

use crate::handler::{HandlerFn, RawRequestStream, RequestContext, RpcResponse};
use crate::router::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use strand_core::compression::decode_payload;
use strand_core::{
    CallContext, CallHead, Compression, Frame, FrameDecoder, FrameKind, Status,
    DEFAULT_MAX_MESSAGE_SIZE, MAX_FRAME_PAYLOAD,
};
use strand_transport::{Listener, TcpTransportListener, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Server limits and encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub max_receive_message_size: usize,
    pub max_send_message_size: usize,
    pub compression: Compression,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Status> {
        let limits = [self.max_receive_message_size, self.max_send_message_size];
        if limits.iter().any(|&size| size == 0 || size > MAX_FRAME_PAYLOAD) {
            return Err(Status::invalid_argument(format!(
                "message size limits must be within 1..={} bytes",
                MAX_FRAME_PAYLOAD
            )));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_receive_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_send_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression: Compression::disabled(),
        }
    }
}

/// Strand RPC server
#[derive(Clone)]
pub struct Server {
    router: Arc<Router>,
    config: ServerConfig,
}

impl Server {
    /// Create a new server with a router
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            config: ServerConfig::default(),
        }
    }

    /// Create a builder for configuring the server
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until the listener is exhausted
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<(), TransportError> {
        loop {
            let transport = match listener.accept().await {
                Ok(transport) => transport,
                Err(TransportError::ConnectionClosed) => {
                    debug!("listener closed");
                    return Ok(());
                }
                Err(err) => {
                    error!("Error accepting connection: {}", err);
                    return Err(err);
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.serve_connection(transport).await {
                    warn!("Error serving connection: {}", err);
                }
            });
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_with_shutdown<L, F>(&self, listener: L, shutdown: F) -> Result<(), TransportError>
    where
        L: Listener,
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve(listener) => result,
            _ = shutdown => {
                info!("Strand server shutting down");
                Ok(())
            }
        }
    }

    /// Serve the server on the given TCP address
    pub async fn serve_tcp(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let listener = TcpTransportListener::bind(addr).await?;
        info!("Strand server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve every call of one connection until the peer goes away.
    ///
    /// Handlers still running when the connection ends see their context
    /// cancelled.
    pub async fn serve_connection(&self, transport: Box<dyn Transport>) -> Result<(), TransportError> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (frames, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(Arc::clone(&transport), queue));

        let connection = Connection {
            router: Arc::clone(&self.router),
            config: self.config,
            frames,
            calls: Arc::new(Mutex::new(HashMap::new())),
        };
        let mut decoder = FrameDecoder::new(self.config.max_receive_message_size);

        let result = loop {
            match transport.receive().await {
                Ok(Some(chunk)) => {
                    decoder.feed(&chunk);
                    loop {
                        match decoder.decode() {
                            Ok(Some(frame)) => connection.on_frame(frame),
                            Ok(None) => break,
                            Err(err) => {
                                warn!(call_id = err.call_id(), "rejecting frame: {}", err);
                                connection.reset(err.call_id(), Status::from(err));
                            }
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        connection.cancel_all();
        writer.abort();
        let _ = transport.close().await;
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("methods", &self.router.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for creating a Strand server
#[derive(Default)]
pub struct ServerBuilder {
    router: Router,
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the router
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Register routes in place
    pub fn routes(mut self, register: impl FnOnce(&mut Router)) -> Self {
        register(&mut self.router);
        self
    }

    pub fn max_receive_message_size(mut self, size: usize) -> Self {
        self.config.max_receive_message_size = size;
        self
    }

    pub fn max_send_message_size(mut self, size: usize) -> Self {
        self.config.max_send_message_size = size;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Build the server.
    ///
    /// Size limits must be non-zero and fit the frame length field.
    pub fn build(self) -> Result<Server, Status> {
        self.config.validate()?;
        Ok(Server {
            router: Arc::new(self.router),
            config: self.config,
        })
    }
}

/// A call the connection is still serving
struct InboundCall {
    context: CallContext,
    /// Dropped on half-close so the handler's request stream ends
    requests: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Per-connection state shared with handler tasks
#[derive(Clone)]
struct Connection {
    router: Arc<Router>,
    config: ServerConfig,
    frames: mpsc::UnboundedSender<Bytes>,
    calls: Arc<Mutex<HashMap<u32, InboundCall>>>,
}

impl Connection {
    fn on_frame(&self, frame: Frame) {
        let call_id = frame.call_id;
        match frame.kind {
            FrameKind::Headers => self.start(call_id, &frame.payload),
            FrameKind::Message => {
                let message = match decode_payload(
                    frame.payload,
                    frame.compressed,
                    self.config.max_receive_message_size,
                ) {
                    Ok(message) => message,
                    Err(status) => {
                        self.reset(call_id, status);
                        return;
                    }
                };
                let calls = lock(&self.calls);
                match calls.get(&call_id).and_then(|call| call.requests.as_ref()) {
                    Some(requests) => {
                        let _ = requests.send(message);
                    }
                    None => trace!(call_id, "dropping message for unknown call"),
                }
            }
            FrameKind::HalfClose => {
                if let Some(call) = lock(&self.calls).get_mut(&call_id) {
                    call.requests.take();
                }
            }
            FrameKind::Reset => {
                let status = Status::from_json(&frame.payload);
                debug!(call_id, code = %status.code(), "call reset by peer");
                if let Some(call) = lock(&self.calls).remove(&call_id) {
                    call.context.cancel();
                }
            }
            FrameKind::Trailers => trace!(call_id, "ignoring trailers from client"),
        }
    }

    fn start(&self, call_id: u32, payload: &Bytes) {
        let head = match CallHead::from_json(payload) {
            Ok(head) => head,
            Err(status) => {
                self.send(Frame::trailers(call_id, &status));
                return;
            }
        };

        let Some(route) = self.router.route(&head.path) else {
            debug!(call_id, path = %head.path, "unknown method");
            let status = Status::unimplemented(format!("unknown method {}", head.path));
            self.send(Frame::trailers(call_id, &status));
            return;
        };

        let context = match head.timeout() {
            Some(timeout) => CallContext::background().with_timeout(timeout),
            None => CallContext::background(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut calls = lock(&self.calls);
            if calls.contains_key(&call_id) {
                drop(calls);
                self.reset(call_id, Status::internal("call id already in use"));
                return;
            }
            calls.insert(
                call_id,
                InboundCall {
                    context: context.clone(),
                    requests: Some(tx),
                },
            );
        }

        trace!(call_id, path = %head.path, timeout_ms = head.timeout_ms, "call started");
        let request = RequestContext::new(head.path, context.clone(), head.metadata);
        let handler = Arc::clone(route.handler());
        let connection = self.clone();
        tokio::spawn(async move {
            connection
                .run(call_id, context, handler, request, RawRequestStream::new(rx))
                .await;
        });
    }

    /// Drive one handler and write its responses followed by the trailers
    async fn run(
        &self,
        call_id: u32,
        context: CallContext,
        handler: HandlerFn,
        request: RequestContext,
        requests: RawRequestStream,
    ) {
        let outcome = context
            .race(async {
                match handler(request, requests).await? {
                    RpcResponse::Unary(message) => self.send_message(call_id, message)?,
                    RpcResponse::Streaming(mut responses) => {
                        while let Some(message) = responses.next().await {
                            self.send_message(call_id, message?)?;
                        }
                    }
                }
                Ok::<_, Status>(())
            })
            .await;

        let status = match outcome {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(status)) | Err(status) => status,
        };

        // A call the client reset is already gone and gets no trailers.
        if lock(&self.calls).remove(&call_id).is_some() {
            if !status.is_ok() {
                debug!(call_id, code = %status.code(), "call failed: {}", status.message());
            }
            self.send(Frame::trailers(call_id, &status));
        }
    }

    fn send_message(&self, call_id: u32, message: Bytes) -> Result<(), Status> {
        if message.len() > self.config.max_send_message_size {
            return Err(Status::resource_exhausted(format!(
                "response of {} bytes exceeds the send limit of {} bytes",
                message.len(),
                self.config.max_send_message_size
            )));
        }
        let (payload, compressed) = self.config.compression.apply(message)?;
        if self.frames.send(Frame::message(call_id, payload, compressed).encode()).is_err() {
            return Err(Status::unavailable("connection closed"));
        }
        Ok(())
    }

    fn send(&self, frame: Frame) {
        let _ = self.frames.send(frame.encode());
    }

    /// Fail one call and tell the client
    fn reset(&self, call_id: u32, status: Status) {
        if let Some(call) = lock(&self.calls).remove(&call_id) {
            call.context.cancel();
        }
        self.send(Frame::reset(call_id, &status));
    }

    fn cancel_all(&self) {
        for (_, call) in lock(&self.calls).drain() {
            call.context.cancel();
        }
    }
}

async fn write_frames(transport: Arc<dyn Transport>, mut queue: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = queue.recv().await {
        if let Err(err) = transport.send(bytes).await {
            debug!("connection write failed: {}", err);
            break;
        }
    }
}
