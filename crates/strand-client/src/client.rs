//! Call dispatcher: the surface generated stubs are written against.

use crate::call::{Call, CallReceiver, CallSender};
use crate::channel::Channel;
use crate::interceptor::{no_hooks, CallStart, Hooks, Interceptor, Next};
use bytes::Bytes;
use futures_core::Stream;
use prost::Message;
use std::fmt;
use std::future::poll_fn;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use strand_core::{CallContext, Metadata, MethodDescriptor, Status};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::instrument;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Absolute deadline
    pub deadline: Option<Instant>,
    /// Relative deadline; the earlier of this and `deadline` applies
    pub timeout: Option<Duration>,
    /// Request metadata sent with the call head
    pub metadata: Metadata,
    /// Context of the inbound call this call is made on behalf of
    pub parent: Option<CallContext>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Inherit deadline and cancellation from `parent` when the channel
    /// propagates call contexts
    pub fn parent(mut self, parent: &CallContext) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

/// Typed RPC client over a [`Channel`]
#[derive(Clone)]
pub struct Client {
    channel: Channel,
    interceptors: Hooks,
}

impl Client {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            interceptors: no_hooks(),
        }
    }

    /// Append an interceptor; interceptors run in the order they were added
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        let mut chain: Vec<Arc<dyn Interceptor>> = self.interceptors.iter().cloned().collect();
        chain.push(Arc::new(interceptor));
        self.interceptors = Arc::from(chain);
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Open an untyped call through the interceptor pipeline
    pub fn start(&self, method: &MethodDescriptor, options: CallOptions) -> Call {
        let context = self.context_for(&options);
        let start = CallStart {
            method: *method,
            context: context.clone(),
            metadata: options.metadata,
        };
        match Next::new(&self.channel, &self.interceptors).run(start) {
            Ok(call) => call,
            Err(status) => Call::failed(*method, context, status, Arc::clone(&self.interceptors)),
        }
    }

    /// Explicit deadline, else the channel default, on top of the parent
    /// context when propagation is enabled
    fn context_for(&self, options: &CallOptions) -> CallContext {
        let config = self.channel.config();
        let base = match &options.parent {
            Some(parent) if config.enable_call_context_propagation => parent.clone(),
            _ => CallContext::background(),
        };

        // A timeout too large to represent means no deadline.
        let now = Instant::now();
        let deadline = if options.deadline.is_some() || options.timeout.is_some() {
            let timeout = options.timeout.and_then(|t| now.checked_add(t));
            match (options.deadline, timeout) {
                (Some(deadline), Some(timeout)) => Some(deadline.min(timeout)),
                (deadline, timeout) => deadline.or(timeout),
            }
        } else {
            config.default_timeout.and_then(|t| now.checked_add(t))
        };
        match deadline {
            Some(deadline) => base.with_deadline(deadline),
            None => base,
        }
    }

    /// Make a unary RPC call
    #[instrument(
        skip(self, request, options),
        fields(
            rpc.service = method.service(),
            rpc.method = method.method(),
            rpc.system = "strand",
            otel.kind = "client"
        )
    )]
    pub async fn unary<Req, Res>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> Result<Res, Status>
    where
        Req: Message,
        Res: Message + Default,
    {
        let call = self.start(method, options);
        call.send(encode(request)).await?;
        let (_sender, mut receiver) = call.split();
        read_single(&mut receiver).await
    }

    /// Make a server-streaming RPC call
    #[instrument(
        skip(self, request, options),
        fields(
            rpc.service = method.service(),
            rpc.method = method.method(),
            rpc.system = "strand",
            otel.kind = "client"
        )
    )]
    pub async fn server_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> Result<Streaming<Res>, Status>
    where
        Req: Message,
        Res: Message + Default,
    {
        let call = self.start(method, options);
        call.send(encode(request)).await?;
        let (_sender, receiver) = call.split();
        Ok(Streaming::new(receiver))
    }

    /// Make a client-streaming RPC call.
    ///
    /// Requests are sent as the stream yields them; sending stops early if
    /// the call ends first.
    #[instrument(
        skip(self, requests, options),
        fields(
            rpc.service = method.service(),
            rpc.method = method.method(),
            rpc.system = "strand",
            otel.kind = "client"
        )
    )]
    pub async fn client_streaming<Req, Res, S>(
        &self,
        method: &MethodDescriptor,
        requests: S,
        options: CallOptions,
    ) -> Result<Res, Status>
    where
        Req: Message,
        Res: Message + Default,
        S: Stream<Item = Req> + Send,
    {
        let call = self.start(method, options);
        let (sender, mut receiver) = call.split();

        tokio::pin!(requests);
        loop {
            let next = tokio::select! {
                request = requests.next() => request,
                _ = sender.status() => None,
            };
            let Some(request) = next else {
                break;
            };
            if sender.send(encode(&request)).await.is_err() {
                break;
            }
        }
        if sender.can_send() {
            let _ = sender.close_send();
        }

        read_single(&mut receiver).await
    }

    /// Make a bidirectional-streaming RPC call.
    ///
    /// The two halves are independent and may be used from different tasks.
    #[instrument(
        skip(self, options),
        fields(
            rpc.service = method.service(),
            rpc.method = method.method(),
            rpc.system = "strand",
            otel.kind = "client"
        )
    )]
    pub async fn bidi_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> Result<(Sender<Req>, Streaming<Res>), Status>
    where
        Req: Message,
        Res: Message + Default,
    {
        let call = self.start(method, options);
        if let Some(status) = call.try_status() {
            if !status.is_ok() {
                return Err(status);
            }
        }
        let (sender, receiver) = call.split();
        Ok((Sender::new(sender), Streaming::new(receiver)))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("channel", &self.channel)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

fn encode<T: Message>(message: &T) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

fn decode<T: Message + Default>(bytes: &Bytes) -> Result<T, Status> {
    T::decode(bytes.as_ref())
        .map_err(|e| Status::internal(format!("failed to decode message: {}", e)))
}

/// One response followed by an `OK` status
async fn read_single<Res: Message + Default>(receiver: &mut CallReceiver) -> Result<Res, Status> {
    let message = receiver.message().await?;
    let status = receiver.status().await;
    if !status.is_ok() {
        return Err(status);
    }
    let message = message.ok_or_else(|| Status::internal("call completed without a response"))?;
    decode(&message)
}

/// Typed response stream
pub struct Streaming<T> {
    receiver: CallReceiver,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message + Default> Streaming<T> {
    fn new(receiver: CallReceiver) -> Self {
        Self {
            receiver,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Next response; `Ok(None)` after the last one when the call succeeded
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        poll_fn(|cx| self.poll_decoded(cx)).await
    }

    fn poll_decoded(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, Status>> {
        let result = match ready!(self.receiver.poll_message(cx)) {
            Ok(Some(bytes)) => match decode(&bytes) {
                Ok(message) => return Poll::Ready(Ok(Some(message))),
                Err(status) => {
                    self.receiver.abort(status.clone());
                    Err(status)
                }
            },
            other => other.map(|_| None),
        };
        self.done = true;
        Poll::Ready(result)
    }

    /// Wait for the terminal status
    pub async fn status(&self) -> Status {
        self.receiver.status().await
    }

    pub fn cancel(&self) {
        self.receiver.cancel();
    }
}

impl<T: Message + Default> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        this.poll_decoded(cx).map(Result::transpose)
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming").field("done", &self.done).finish()
    }
}

/// Typed request sink of a bidirectional call.
///
/// Dropping it closes the request stream.
pub struct Sender<T> {
    inner: CallSender,
    _marker: PhantomData<fn(T)>,
}

impl<T: Message> Sender<T> {
    fn new(inner: CallSender) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, message: &T) -> Result<(), Status> {
        self.inner.send(encode(message)).await
    }

    /// Close the request stream
    pub fn close(&self) -> Result<(), Status> {
        self.inner.close_send()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Wait for the terminal status
    pub async fn status(&self) -> Status {
        self.inner.status().await
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.inner.can_send() {
            let _ = self.inner.close_send();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}
