//! Handler-facing types: the inbound call, its request stream and the
//! response a handler produces.

use bytes::Bytes;
use futures_core::Stream;
use pin_project_lite::pin_project;
use prost::Message;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use strand_core::{CallContext, Metadata, Status};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Boxed stream of encoded response messages
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// Type-erased handler stored in the router
pub type HandlerFn = Arc<
    dyn Fn(RequestContext, RawRequestStream) -> Pin<Box<dyn Future<Output = Result<RpcResponse, Status>> + Send>>
        + Send
        + Sync,
>;

/// Response type that can be either unary or streaming
pub enum RpcResponse {
    /// Unary response (single message)
    Unary(Bytes),
    /// Streaming response (multiple messages)
    Streaming(ResponseStream),
}

impl RpcResponse {
    pub fn unary(bytes: Bytes) -> Self {
        Self::Unary(bytes)
    }

    pub fn streaming<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Status>> + Send + 'static,
    {
        Self::Streaming(Box::pin(stream))
    }
}

/// The inbound side of a call as a handler sees it
#[derive(Debug, Clone)]
pub struct RequestContext {
    path: String,
    context: CallContext,
    metadata: Metadata,
}

impl RequestContext {
    pub(crate) fn new(path: String, context: CallContext, metadata: Metadata) -> Self {
        Self {
            path,
            context,
            metadata,
        }
    }

    /// `/{service}/{method}`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fires when the caller cancels, disconnects or runs out of time.
    ///
    /// Pass it as the parent of outbound calls made on the caller's behalf.
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Time left before the caller's deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.context.remaining()
    }
}

pin_project! {
    /// Request messages of one call, still encoded.
    ///
    /// Ends when the caller half-closes.
    pub struct RawRequestStream {
        #[pin]
        inner: UnboundedReceiverStream<Bytes>,
    }
}

impl RawRequestStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Next request, or `None` once the caller half-closed
    pub async fn message(&mut self) -> Option<Bytes> {
        self.next().await
    }

    /// The only request of a single-request call
    pub(crate) async fn single<T: Message + Default>(&mut self) -> Result<T, Status> {
        match self.message().await {
            Some(bytes) => decode(&bytes),
            None => Err(Status::invalid_argument("missing request message")),
        }
    }
}

impl Stream for RawRequestStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

pin_project! {
    /// Decoded request messages of a client- or bidi-streaming call
    pub struct RequestStream<T> {
        #[pin]
        inner: RawRequestStream,
        _marker: PhantomData<fn() -> T>,
    }
}

impl<T: Message + Default> RequestStream<T> {
    pub(crate) fn new(inner: RawRequestStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Next request; `Ok(None)` once the caller half-closed
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        self.next().await.transpose()
    }
}

impl<T: Message + Default> Stream for RequestStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .inner
            .poll_next(cx)
            .map(|message| message.map(|bytes| decode(&bytes)))
    }
}

pub(crate) fn encode<T: Message>(message: &T) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

pub(crate) fn decode<T: Message + Default>(bytes: &Bytes) -> Result<T, Status> {
    T::decode(bytes.as_ref())
        .map_err(|e| Status::invalid_argument(format!("failed to decode request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Count {
        #[prost(int32, tag = "1")]
        n: i32,
    }

    #[tokio::test]
    async fn test_request_stream_decodes_until_half_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(encode(&Count { n: 1 })).unwrap();
        tx.send(encode(&Count { n: 2 })).unwrap();
        drop(tx);

        let mut requests = RequestStream::<Count>::new(RawRequestStream::new(rx));
        assert_eq!(requests.message().await.unwrap(), Some(Count { n: 1 }));
        assert_eq!(requests.message().await.unwrap(), Some(Count { n: 2 }));
        assert_eq!(requests.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_stream_reports_garbage() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(&[0xff, 0xff, 0xff])).unwrap();

        let mut requests = RequestStream::<Count>::new(RawRequestStream::new(rx));
        let err = requests.message().await.unwrap_err();
        assert_eq!(err.code(), strand_core::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_single_without_request() {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        drop(tx);

        let mut requests = RawRequestStream::new(rx);
        let err = requests.single::<Count>().await.unwrap_err();
        assert_eq!(err.code(), strand_core::Code::InvalidArgument);
    }
}
