//! Client interceptors.
//!
//! Interceptors form a fixed, ordered pipeline set when a
//! [`Client`](crate::Client) is built. Each one sees the call before it is
//! opened and may rewrite it, observe it, or refuse it with a [`Status`].
//! The `on_*` hooks observe messages and the terminal status of every call
//! that passed through the pipeline.

use crate::call::Call;
use crate::channel::Channel;
use bytes::Bytes;
use std::sync::Arc;
use strand_core::{CallContext, Metadata, MethodDescriptor, Status};
use tracing::{debug, warn};

/// Interceptors attached to one call
pub(crate) type Hooks = Arc<[Arc<dyn Interceptor>]>;

pub(crate) fn no_hooks() -> Hooks {
    Arc::from(Vec::<Arc<dyn Interceptor>>::new())
}

/// Everything needed to open a call
#[derive(Debug, Clone)]
pub struct CallStart {
    pub method: MethodDescriptor,
    pub context: CallContext,
    pub metadata: Metadata,
}

/// The rest of the pipeline.
///
/// Consumed by value, so an interceptor can continue a call at most once.
pub struct Next<'a> {
    channel: &'a Channel,
    remaining: &'a [Arc<dyn Interceptor>],
    hooks: &'a Hooks,
}

impl<'a> Next<'a> {
    pub(crate) fn new(channel: &'a Channel, hooks: &'a Hooks) -> Self {
        Self {
            channel,
            remaining: hooks,
            hooks,
        }
    }

    /// Hand the call to the next interceptor, or open it on the channel
    pub fn run(self, start: CallStart) -> Result<Call, Status> {
        match self.remaining.split_first() {
            Some((first, rest)) => first.intercept(
                start,
                Next {
                    remaining: rest,
                    ..self
                },
            ),
            None => Ok(self.channel.open_with_hooks(start, Arc::clone(self.hooks))),
        }
    }
}

/// Hook points around call creation, messages and completion
pub trait Interceptor: Send + Sync + 'static {
    /// Continue with `next.run(start)`, or return `Err` to fail the call
    /// without opening it
    fn intercept(&self, start: CallStart, next: Next<'_>) -> Result<Call, Status> {
        next.run(start)
    }

    /// Called with every outgoing message, before compression
    fn on_send(&self, _method: &MethodDescriptor, _message: &Bytes) {}

    /// Called with every message handed to the caller
    fn on_receive(&self, _method: &MethodDescriptor, _message: &Bytes) {}

    /// Called exactly once with the call's terminal status
    fn on_complete(&self, _method: &MethodDescriptor, _status: &Status) {}
}

/// Logs call starts and completions
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for TracingInterceptor {
    fn intercept(&self, start: CallStart, next: Next<'_>) -> Result<Call, Status> {
        debug!(
            rpc.service = start.method.service(),
            rpc.method = start.method.method(),
            rpc.shape = %start.method.shape(),
            timeout_ms = start.context.remaining().map(|d| d.as_millis() as u64),
            "starting call"
        );
        next.run(start)
    }

    fn on_complete(&self, method: &MethodDescriptor, status: &Status) {
        if status.is_ok() {
            debug!(
                rpc.service = method.service(),
                rpc.method = method.method(),
                "call completed"
            );
        } else {
            warn!(
                rpc.service = method.service(),
                rpc.method = method.method(),
                code = %status.code(),
                message = status.message(),
                "call failed"
            );
        }
    }
}

/// Adds fixed request metadata (auth tokens, user agent) to every call.
///
/// Entries already set on the call win.
#[derive(Debug, Clone, Default)]
pub struct MetadataInterceptor {
    metadata: Metadata,
}

impl MetadataInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

impl Interceptor for MetadataInterceptor {
    fn intercept(&self, mut start: CallStart, next: Next<'_>) -> Result<Call, Status> {
        for (key, value) in self.metadata.iter() {
            if !start.metadata.contains_key(key) {
                start.metadata.insert(key, value);
            }
        }
        next.run(start)
    }
}
