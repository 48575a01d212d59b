//! Method router
//!
//! Routes match the call head path: `/{service}/{method}`

use crate::handler::{
    encode, HandlerFn, RawRequestStream, RequestContext, RequestStream, RpcResponse,
};
use futures_core::Stream;
use prost::Message;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use strand_core::{MethodDescriptor, Status, StreamingShape};
use tokio_stream::StreamExt;

/// A registered method
#[derive(Clone)]
pub struct Route {
    shape: StreamingShape,
    handler: HandlerFn,
}

impl Route {
    pub fn shape(&self) -> StreamingShape {
        self.shape
    }

    pub(crate) fn handler(&self) -> &HandlerFn {
        &self.handler
    }
}

/// RPC Router
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an untyped handler for `method`.
    ///
    /// A later registration for the same path replaces the earlier one.
    pub fn register<F, Fut>(&mut self, method: &MethodDescriptor, handler: F)
    where
        F: Fn(RequestContext, RawRequestStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcResponse, Status>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx: RequestContext, requests: RawRequestStream| {
            Box::pin(handler(ctx, requests)) as Pin<Box<_>>
        });
        self.routes.insert(
            method.path(),
            Route {
                shape: method.shape(),
                handler,
            },
        );
    }

    /// Register a unary handler
    pub fn register_unary<Req, Res, F, Fut>(&mut self, method: &MethodDescriptor, handler: F)
    where
        Req: Message + Default + Send + 'static,
        Res: Message + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |ctx, mut requests| {
            let handler = Arc::clone(&handler);
            async move {
                let request = requests.single::<Req>().await?;
                let response = handler(ctx, request).await?;
                Ok::<_, Status>(RpcResponse::Unary(encode(&response)))
            }
        });
    }

    /// Register a server-streaming handler
    pub fn register_server_streaming<Req, Res, S, F, Fut>(&mut self, method: &MethodDescriptor, handler: F)
    where
        Req: Message + Default + Send + 'static,
        Res: Message + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |ctx, mut requests| {
            let handler = Arc::clone(&handler);
            async move {
                let request = requests.single::<Req>().await?;
                let responses = handler(ctx, request).await?;
                Ok::<_, Status>(encode_stream(responses))
            }
        });
    }

    /// Register a client-streaming handler
    pub fn register_client_streaming<Req, Res, F, Fut>(&mut self, method: &MethodDescriptor, handler: F)
    where
        Req: Message + Default + Send + 'static,
        Res: Message + Send + 'static,
        F: Fn(RequestContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |ctx, requests| {
            let handler = Arc::clone(&handler);
            async move {
                let response = handler(ctx, RequestStream::new(requests)).await?;
                Ok::<_, Status>(RpcResponse::Unary(encode(&response)))
            }
        });
    }

    /// Register a bidirectional-streaming handler
    pub fn register_bidi_streaming<Req, Res, S, F, Fut>(&mut self, method: &MethodDescriptor, handler: F)
    where
        Req: Message + Default + Send + 'static,
        Res: Message + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        F: Fn(RequestContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |ctx, requests| {
            let handler = Arc::clone(&handler);
            async move {
                let responses = handler(ctx, RequestStream::new(requests)).await?;
                Ok::<_, Status>(encode_stream(responses))
            }
        });
    }

    /// Find the route for a call head path
    pub fn route(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    /// Registered paths
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn encode_stream<Res, S>(responses: S) -> RpcResponse
where
    Res: Message + 'static,
    S: Stream<Item = Result<Res, Status>> + Send + 'static,
{
    RpcResponse::streaming(responses.map(|item| item.map(|message| encode(&message))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    const ECHO: MethodDescriptor = MethodDescriptor::new("test.Echo", "Echo", StreamingShape::Unary);
    const WATCH: MethodDescriptor =
        MethodDescriptor::new("test.Echo", "Watch", StreamingShape::ServerStreaming);

    #[derive(Clone, PartialEq, prost::Message)]
    struct Text {
        #[prost(string, tag = "1")]
        value: String,
    }

    fn context() -> RequestContext {
        RequestContext::new(ECHO.path(), Default::default(), Default::default())
    }

    #[tokio::test]
    async fn test_unary_route() {
        let mut router = Router::new();
        router.register_unary(&ECHO, |_ctx, req: Text| async move {
            Ok::<_, Status>(Text {
                value: req.value.to_uppercase(),
            })
        });

        let route = router.route("/test.Echo/Echo").unwrap();
        assert_eq!(route.shape(), StreamingShape::Unary);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(encode(&Text { value: "hi".into() })).unwrap();
        let response = (route.handler())(context(), RawRequestStream::new(rx)).await.unwrap();
        match response {
            RpcResponse::Unary(bytes) => {
                assert_eq!(Text::decode(bytes).unwrap().value, "HI");
            }
            RpcResponse::Streaming(_) => panic!("expected unary response"),
        }
    }

    #[tokio::test]
    async fn test_server_streaming_route() {
        let mut router = Router::new();
        router.register_server_streaming(&WATCH, |_ctx, req: Text| async move {
            let items: Vec<Result<Text, Status>> = (0..3)
                .map(|i| Ok(Text { value: format!("{}-{}", req.value, i) }))
                .collect();
            Ok::<_, Status>(tokio_stream::iter(items))
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(encode(&Text { value: "w".into() })).unwrap();
        let route = router.route(&WATCH.path()).unwrap();
        let response = (route.handler())(context(), RawRequestStream::new(rx)).await.unwrap();
        let RpcResponse::Streaming(mut stream) = response else {
            panic!("expected streaming response");
        };

        let mut values = Vec::new();
        while let Some(item) = stream.next().await {
            let bytes: Bytes = item.unwrap();
            values.push(Text::decode(bytes).unwrap().value);
        }
        assert_eq!(values, vec!["w-0", "w-1", "w-2"]);
    }

    #[test]
    fn test_unknown_path() {
        let mut router = Router::new();
        router.register_unary(&ECHO, |_ctx, req: Text| async move { Ok::<_, Status>(req) });

        assert_eq!(router.len(), 1);
        assert!(router.route("/test.Echo/Missing").is_none());
        assert!(router.route("test.Echo/Echo").is_none());
        assert_eq!(router.paths().collect::<Vec<_>>(), vec!["/test.Echo/Echo"]);
    }
}
