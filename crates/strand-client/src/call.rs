//! A single logical call multiplexed over a channel.
//!
//! A [`Call`] owns both halves of the exchange: the request side
//! ([`CallSender`]) and the response side ([`CallReceiver`]). They can be
//! used together or split and moved to different tasks. Whichever way it is
//! used, the call ends with exactly one terminal [`Status`].

use crate::channel::{lock, ChannelInner};
use crate::interceptor::Hooks;
use bytes::Bytes;
use std::future::poll_fn;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use strand_core::{
    CallContext, Frame, FrameKind, MethodDescriptor, SendWindow, Status, StreamStateMachine,
};
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// State shared between a call's handles and the channel's call table
pub(crate) struct CallCore {
    id: u32,
    method: MethodDescriptor,
    context: CallContext,
    stream: Mutex<StreamStateMachine>,
    status: watch::Sender<Option<Status>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    window: SendWindow,
    hooks: Hooks,
}

impl CallCore {
    pub(crate) fn new(
        id: u32,
        method: MethodDescriptor,
        context: CallContext,
        watermark: usize,
        hooks: Hooks,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(None);
        let core = Arc::new(Self {
            id,
            method,
            context,
            stream: Mutex::new(StreamStateMachine::new(method.shape())),
            status,
            inbound: Mutex::new(Some(tx)),
            window: SendWindow::new(watermark),
            hooks,
        });
        (core, rx)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn stream(&self) -> MutexGuard<'_, StreamStateMachine> {
        lock(&self.stream)
    }

    pub(crate) fn status(&self) -> Option<Status> {
        self.status.borrow().clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status.borrow().is_some()
    }

    /// Record the terminal status; later calls are ignored.
    ///
    /// Wakes every reader and blocked writer of the call.
    pub(crate) fn finish(&self, status: Status) -> bool {
        let applied = self.status.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            true
        });
        if !applied {
            return false;
        }

        self.stream().fail();
        self.window.close();
        // Closing the inbound queue lets readers drain what already arrived.
        lock(&self.inbound).take();

        if let Some(status) = self.status() {
            trace!(call_id = self.id, code = %status.code(), "call finished");
            for hook in self.hooks.iter() {
                hook.on_complete(&self.method, &status);
            }
        }
        true
    }

    /// Queue a response message for the caller
    pub(crate) fn deliver(&self, message: Bytes) -> Result<(), Status> {
        self.stream().on_receive()?;
        if let Some(tx) = lock(&self.inbound).as_ref() {
            let _ = tx.send(message);
        }
        Ok(())
    }

    /// The peer sent its trailers
    pub(crate) fn remote_closed(&self) -> Result<(), Status> {
        self.stream().on_remote_close()
    }
}

/// Ties a call to its channel; cancels the call when the last half is dropped
struct CallHandle {
    core: Arc<CallCore>,
    channel: Option<Arc<ChannelInner>>,
}

impl CallHandle {
    async fn status(&self) -> Status {
        let mut rx = self.core.status.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| Status::internal("call ended without a status"))
    }

    /// Error for writing to a call that already ended
    fn ended(&self) -> Option<Status> {
        self.core.status().map(|status| {
            if status.is_ok() {
                Status::failed_precondition("call already completed")
            } else {
                status
            }
        })
    }

    fn channel(&self) -> Result<&Arc<ChannelInner>, Status> {
        self.channel
            .as_ref()
            .ok_or_else(|| Status::internal("call is not attached to a channel"))
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.core.is_terminal() {
            return;
        }
        if let Some(channel) = &self.channel {
            channel.abort(self.core.id, Status::cancelled("call dropped before completion"));
        }
    }
}

/// Request half of a call
pub struct CallSender {
    handle: Arc<CallHandle>,
}

impl CallSender {
    /// Queue one request message.
    ///
    /// Waits while the call's queued-but-unwritten bytes exceed the send
    /// watermark. Fails with the call's terminal status once it has ended,
    /// and with `FailedPrecondition` after the request side was closed.
    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        let core = &self.handle.core;
        if let Some(status) = self.handle.ended() {
            return Err(status);
        }
        let channel = self.handle.channel()?;
        let config = channel.config();

        if message.len() > config.max_send_message_size {
            let status = Status::resource_exhausted(format!(
                "message of {} bytes exceeds the send limit of {} bytes",
                message.len(),
                config.max_send_message_size
            ));
            channel.abort(core.id, status.clone());
            return Err(status);
        }

        let half_close = core.stream().on_send()?;
        for hook in core.hooks.iter() {
            hook.on_send(&core.method, &message);
        }

        let (payload, compressed) = match config.compression.apply(message) {
            Ok(encoded) => encoded,
            Err(status) => {
                channel.abort(core.id, status.clone());
                return Err(status);
            }
        };

        let permit = match core.window.reserve(payload.len()).await {
            Ok(permit) => permit,
            Err(closed) => return Err(self.handle.ended().unwrap_or(closed)),
        };

        let frame = Frame::message(core.id, payload, compressed);
        channel.write(core.id, FrameKind::Message, frame.encode(), Some(permit))?;
        if half_close {
            channel.write(core.id, FrameKind::HalfClose, Frame::half_close(core.id).encode(), None)?;
        }
        Ok(())
    }

    /// Signal that no more requests follow
    pub fn close_send(&self) -> Result<(), Status> {
        if let Some(status) = self.handle.ended() {
            return Err(status);
        }
        let channel = self.handle.channel()?;
        let id = self.handle.core.id;
        self.handle.core.stream().close_send()?;
        channel.write(id, FrameKind::HalfClose, Frame::half_close(id).encode(), None)
    }

    /// Whether another message may be sent
    pub fn can_send(&self) -> bool {
        !self.handle.core.is_terminal() && self.handle.core.stream().can_send()
    }

    pub fn cancel(&self) {
        self.handle.core.context.cancel();
    }

    /// Wait for the terminal status
    pub async fn status(&self) -> Status {
        self.handle.status().await
    }
}

/// Response half of a call
pub struct CallReceiver {
    handle: Arc<CallHandle>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    read_done: bool,
}

impl CallReceiver {
    /// Next response message in arrival order.
    ///
    /// `Ok(None)` once the call completed with `OK` and every message was
    /// read; `Err` with the terminal status if it failed. Reading again after
    /// that is `FailedPrecondition`.
    pub async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        poll_fn(|cx| self.poll_message(cx)).await
    }

    pub fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>, Status>> {
        if self.read_done {
            return Poll::Ready(Err(Status::failed_precondition(
                "read past the end of the response stream",
            )));
        }

        match self.inbound.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(message)) => {
                let core = &self.handle.core;
                for hook in core.hooks.iter() {
                    hook.on_receive(&core.method, &message);
                }
                Poll::Ready(Ok(Some(message)))
            }
            Poll::Ready(None) => {
                self.read_done = true;
                match self.handle.core.status() {
                    Some(status) if status.is_ok() => Poll::Ready(Ok(None)),
                    Some(status) => Poll::Ready(Err(status)),
                    None => Poll::Ready(Err(Status::internal("call ended without a status"))),
                }
            }
        }
    }

    pub fn cancel(&self) {
        self.handle.core.context.cancel();
    }

    /// Wait for the terminal status
    pub async fn status(&self) -> Status {
        self.handle.status().await
    }

    /// Fail the call locally, e.g. when a response cannot be decoded
    pub(crate) fn abort(&self, status: Status) {
        match &self.handle.channel {
            Some(channel) => channel.abort(self.handle.core.id, status),
            None => {
                self.handle.core.finish(status);
            }
        }
    }
}

/// A call in flight
pub struct Call {
    sender: CallSender,
    receiver: CallReceiver,
}

impl Call {
    pub(crate) fn new(
        core: Arc<CallCore>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        channel: Option<Arc<ChannelInner>>,
    ) -> Self {
        let handle = Arc::new(CallHandle { core, channel });
        Self {
            sender: CallSender {
                handle: Arc::clone(&handle),
            },
            receiver: CallReceiver {
                handle,
                inbound,
                read_done: false,
            },
        }
    }

    /// A call that ended before it was opened
    pub(crate) fn failed(
        method: MethodDescriptor,
        context: CallContext,
        status: Status,
        hooks: Hooks,
    ) -> Self {
        let (core, inbound) = CallCore::new(0, method, context, 1, hooks);
        core.finish(status);
        Self::new(core, inbound, None)
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.sender.handle.core.method
    }

    /// The call's own context; firing it ends the call
    pub fn context(&self) -> &CallContext {
        &self.sender.handle.core.context
    }

    /// The terminal status, if the call has ended
    pub fn try_status(&self) -> Option<Status> {
        self.sender.handle.core.status()
    }

    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        self.sender.send(message).await
    }

    pub fn close_send(&self) -> Result<(), Status> {
        self.sender.close_send()
    }

    pub async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        self.receiver.message().await
    }

    pub fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>, Status>> {
        self.receiver.poll_message(cx)
    }

    /// Wait for the terminal status
    pub async fn status(&self) -> Status {
        self.sender.status().await
    }

    /// Cancel the call; the peer is told best-effort
    pub fn cancel(&self) {
        self.sender.cancel();
    }

    /// Separate the request and response halves
    pub fn split(self) -> (CallSender, CallReceiver) {
        (self.sender, self.receiver)
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = &self.sender.handle.core;
        f.debug_struct("Call")
            .field("id", &core.id)
            .field("method", &core.method)
            .field("status", &core.status())
            .finish()
    }
}
