//! Channel: one logical connection multiplexing many calls.
//!
//! A [`Channel`] is cheap to clone and safe to share across tasks. It does no
//! I/O until the first call is opened. A single driver task then owns the
//! connection: it connects, writes every frame, reconnects with backoff after
//! failures and publishes its [`ConnectivityState`] through a watch channel.
//! A reader task per connection routes inbound frames to calls through the
//! shared call table.

use crate::call::{Call, CallCore};
use crate::config::{BackoffConfig, ChannelConfig, TransientFailurePolicy};
use crate::driver::{Command, Driver, Outbound};
use crate::interceptor::{no_hooks, CallStart, Hooks};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use strand_core::{
    CallContext, CallHead, Compression, FrameKind, Metadata, MethodDescriptor, SendPermit, Status,
};
use strand_transport::{Connector, TcpConnector};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic halfway through an update.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connectivity of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No connection and no attempt in progress
    Idle,
    /// A connection attempt is in progress
    Connecting,
    /// Connected; calls are written immediately
    Ready,
    /// The last attempt failed or the connection was lost
    TransientFailure,
    /// Closed for good
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

struct CallEntry {
    core: Arc<CallCore>,
    /// Connection instance the call's headers were written to
    generation: Option<u64>,
}

/// State shared by channel handles, the driver and the reader tasks
pub(crate) struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    calls: Mutex<HashMap<u32, CallEntry>>,
    state: watch::Sender<ConnectivityState>,
    next_id: AtomicU32,
}

impl Shared {
    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: ConnectivityState) {
        let changed = self.state.send_if_modified(|state| {
            // Shutdown is terminal.
            if *state == next || *state == ConnectivityState::Shutdown {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(endpoint = %self.connector.endpoint(), state = %next, "connectivity changed");
        }
    }

    fn allocate_id(&self) -> u32 {
        let calls = lock(&self.calls);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !calls.contains_key(&id) {
                return id;
            }
        }
    }

    /// Add the call to the table unless the channel has shut down.
    ///
    /// Shutdown is published before the table is drained, so checking it
    /// under the table lock leaves no call behind.
    fn register(&self, core: &Arc<CallCore>) -> Result<(), Status> {
        let mut calls = lock(&self.calls);
        if self.state() == ConnectivityState::Shutdown {
            return Err(Status::unavailable("channel is shut down"));
        }
        calls.insert(
            core.id(),
            CallEntry {
                core: Arc::clone(core),
                generation: None,
            },
        );
        Ok(())
    }

    pub(crate) fn lookup(&self, id: u32) -> Option<Arc<CallCore>> {
        lock(&self.calls).get(&id).map(|entry| Arc::clone(&entry.core))
    }

    pub(crate) fn is_active(&self, id: u32) -> bool {
        lock(&self.calls).contains_key(&id)
    }

    /// Record that the call's headers went out on connection `generation`
    pub(crate) fn bind(&self, id: u32, generation: u64) -> bool {
        match lock(&self.calls).get_mut(&id) {
            Some(entry) => {
                entry.generation = Some(generation);
                true
            }
            None => false,
        }
    }

    /// Remove the call from the table and set its terminal status.
    ///
    /// Returns the connection the call was bound to, or `None` if the call
    /// had already completed.
    pub(crate) fn complete(&self, id: u32, status: Status) -> Option<Option<u64>> {
        let entry = lock(&self.calls).remove(&id)?;
        entry.core.finish(status);
        Some(entry.generation)
    }

    /// Fail every call written to connection `generation`
    pub(crate) fn fail_generation(&self, generation: u64, status: &Status) -> usize {
        let failed: Vec<CallEntry> = {
            let mut calls = lock(&self.calls);
            let ids: Vec<u32> = calls
                .iter()
                .filter(|(_, entry)| entry.generation == Some(generation))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };
        for entry in &failed {
            entry.core.finish(status.clone());
        }
        failed.len()
    }

    /// Fail every outstanding call
    pub(crate) fn fail_all(&self, status: &Status) -> usize {
        let failed: Vec<CallEntry> = lock(&self.calls).drain().map(|(_, entry)| entry).collect();
        for entry in &failed {
            entry.core.finish(status.clone());
        }
        failed.len()
    }

    pub(crate) fn active_calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

/// What channel handles and live calls hold on to.
///
/// The driver runs until every clone of `commands` is gone or `close` is
/// called.
pub(crate) struct ChannelInner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl ChannelInner {
    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Start the driver on first use
    fn ensure_driver(&self) -> Result<(), Status> {
        let mut slot = lock(&self.driver);
        let Some(commands) = slot.take() else {
            return Ok(());
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            *slot = Some(commands);
            return Err(Status::internal("channel used outside of a tokio runtime"));
        };
        let driver = Driver::new(Arc::clone(&self.shared), commands);
        runtime.spawn(driver.run());
        Ok(())
    }

    fn command(&self, command: Command) -> Result<(), Status> {
        self.commands
            .send(command)
            .map_err(|_| Status::unavailable("channel is shut down"))
    }

    /// Hand an encoded frame of call `id` to the driver
    pub(crate) fn write(
        &self,
        id: u32,
        kind: FrameKind,
        bytes: Bytes,
        permit: Option<SendPermit>,
    ) -> Result<(), Status> {
        let outbound = Outbound {
            call_id: id,
            kind,
            bytes,
            permit,
        };
        if let Err(status) = self.command(Command::Write(outbound)) {
            self.shared.complete(id, status.clone());
            return Err(status);
        }
        Ok(())
    }

    /// End call `id` locally and reset it on the wire
    pub(crate) fn abort(&self, id: u32, status: Status) {
        if let Some(generation) = self.shared.complete(id, status.clone()) {
            let _ = self.command(Command::Reset {
                call_id: id,
                status,
                generation,
            });
        }
    }
}

/// A multiplexed connection to one endpoint
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel; no connection is made until the first call
    pub fn new(connector: impl Connector, config: ChannelConfig) -> Self {
        Self::from_shared_connector(Arc::new(connector), config)
    }

    pub fn from_shared_connector(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            connector,
            calls: Mutex::new(HashMap::new()),
            state,
            next_id: AtomicU32::new(1),
        });
        Self {
            inner: Arc::new(ChannelInner {
                shared,
                commands,
                driver: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Create a builder for configuring the channel
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    pub fn config(&self) -> &ChannelConfig {
        self.inner.config()
    }

    /// Human-readable endpoint of the connector
    pub fn endpoint(&self) -> String {
        self.inner.shared.connector.endpoint()
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.shared.state()
    }

    /// Subscribe to connectivity changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.shared.state.subscribe()
    }

    /// Wait until the state differs from `last_observed`; returns the new state
    pub async fn wait_for_state_change(&self, last_observed: ConnectivityState) -> ConnectivityState {
        let mut rx = self.watch_state();
        let result = match rx.wait_for(|state| *state != last_observed).await {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Shutdown,
        };
        result
    }

    /// Start connecting if idle, without opening a call
    pub fn connect(&self) -> Result<(), Status> {
        if self.state() == ConnectivityState::Shutdown {
            return Err(Status::unavailable("channel is shut down"));
        }
        self.inner.ensure_driver()?;
        self.inner.command(Command::Connect)
    }

    /// Number of calls that have not reached a terminal status
    pub fn active_calls(&self) -> usize {
        self.inner.shared.active_calls()
    }

    /// Open a call.
    ///
    /// Never waits for the network: the call is registered and its headers
    /// are queued for the driver. A context that has already fired yields a
    /// call that is terminated with the matching status and never touches
    /// the connection.
    pub fn open(&self, method: &MethodDescriptor, context: &CallContext, metadata: Metadata) -> Call {
        self.open_with_hooks(
            CallStart {
                method: *method,
                context: context.clone(),
                metadata,
            },
            no_hooks(),
        )
    }

    pub(crate) fn open_with_hooks(&self, start: CallStart, hooks: Hooks) -> Call {
        let CallStart {
            method,
            context,
            metadata,
        } = start;
        // The call gets its own context so cancelling it leaves the caller's intact.
        let context = context.with_cancel();

        if let Err(status) = context.check() {
            return Call::failed(method, context, status, hooks);
        }

        let shared = &self.inner.shared;
        match shared.state() {
            ConnectivityState::Shutdown => {
                return Call::failed(
                    method,
                    context,
                    Status::unavailable("channel is shut down"),
                    hooks,
                );
            }
            ConnectivityState::TransientFailure
                if shared.config.transient_failure_policy == TransientFailurePolicy::FailFast =>
            {
                return Call::failed(
                    method,
                    context,
                    Status::unavailable("channel is in transient failure"),
                    hooks,
                );
            }
            _ => {}
        }
        if let Err(status) = self.inner.ensure_driver() {
            return Call::failed(method, context, status, hooks);
        }

        let head = CallHead::new(method.path())
            .with_timeout(context.remaining())
            .with_metadata(metadata);
        let head = match head.to_json() {
            Ok(json) => Bytes::from(json),
            Err(status) => return Call::failed(method, context, status, hooks),
        };

        let id = shared.allocate_id();
        let (core, inbound) = CallCore::new(
            id,
            method,
            context.clone(),
            shared.config.send_buffer_watermark,
            hooks,
        );
        let registered = core.stream().open().and_then(|()| shared.register(&core));
        if let Err(status) = registered {
            core.finish(status);
            return Call::new(core, inbound, None);
        }

        if let Err(status) = self.inner.command(Command::Start { call_id: id, head }) {
            shared.complete(id, status);
        }

        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        context.on_signal(move |signal| {
            if let Some(inner) = weak.upgrade() {
                inner.abort(id, signal.to_status());
            }
        });

        Call::new(core, inbound, Some(Arc::clone(&self.inner)))
    }

    /// Close the channel.
    ///
    /// Every outstanding call fails with `Unavailable` and the connection is
    /// released. Calls opened afterwards fail immediately.
    pub async fn close(&self) {
        let never_started = lock(&self.inner.driver).take().is_some();
        if never_started {
            self.inner.shared.set_state(ConnectivityState::Shutdown);
            self.inner
                .shared
                .fail_all(&Status::unavailable("channel closed"));
            return;
        }

        let (done, wait) = oneshot::channel();
        if self.inner.command(Command::Close { done }).is_ok() {
            let _ = wait.await;
        }
        self.inner.shared.set_state(ConnectivityState::Shutdown);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .field("active_calls", &self.active_calls())
            .finish()
    }
}

/// Builder for configuring a channel
#[derive(Default)]
pub struct ChannelBuilder {
    connector: Option<Arc<dyn Connector>>,
    address: Option<SocketAddr>,
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect through a custom connector (memory, TLS, proxies)
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Connect over TCP to `address`
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_send_message_size(mut self, size: usize) -> Self {
        self.config.max_send_message_size = size;
        self
    }

    pub fn max_receive_message_size(mut self, size: usize) -> Self {
        self.config.max_receive_message_size = size;
        self
    }

    /// Deadline for calls that do not set one
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.reconnect_backoff = backoff;
        self
    }

    pub fn enable_call_context_propagation(mut self, enable: bool) -> Self {
        self.config.enable_call_context_propagation = enable;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn transient_failure_policy(mut self, policy: TransientFailurePolicy) -> Self {
        self.config.transient_failure_policy = policy;
        self
    }

    pub fn max_pending_calls(mut self, max: usize) -> Self {
        self.config.max_pending_calls = max;
        self
    }

    pub fn send_buffer_watermark(mut self, bytes: usize) -> Self {
        self.config.send_buffer_watermark = bytes;
        self
    }

    /// Compress outgoing messages with zstd
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn build(self) -> Result<Channel, Status> {
        self.config
            .validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let connector: Arc<dyn Connector> = match (self.connector, self.address) {
            (Some(connector), _) => connector,
            (None, Some(address)) => {
                let mut builder = TcpConnector::builder(address);
                if let Some(timeout) = self.config.connect_timeout {
                    builder = builder.connect_timeout(timeout);
                }
                Arc::new(builder.build())
            }
            (None, None) => {
                return Err(Status::invalid_argument(
                    "a connector or an address is required",
                ))
            }
        };
        Ok(Channel::from_shared_connector(connector, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{Code, StreamingShape};
    use strand_transport::memory_endpoint;

    const PING: MethodDescriptor = MethodDescriptor::new("test.Ping", "Ping", StreamingShape::Unary);

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectivityState::Idle.to_string(), "IDLE");
        assert_eq!(
            ConnectivityState::TransientFailure.to_string(),
            "TRANSIENT_FAILURE"
        );
    }

    #[test]
    fn test_builder_requires_endpoint() {
        let err = Channel::builder().build().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_builder_validates_config() {
        let (connector, _listener) = memory_endpoint(1024);
        let err = Channel::builder()
            .connector(connector)
            .max_send_message_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_open_outside_runtime() {
        let (connector, _listener) = memory_endpoint(1024);
        let channel = Channel::new(connector, ChannelConfig::default());

        let call = channel.open(&PING, &CallContext::background(), Metadata::new());
        assert_eq!(call.try_status().unwrap().code(), Code::Internal);
        assert_eq!(channel.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_open_with_cancelled_context() {
        let (connector, _listener) = memory_endpoint(1024);
        let channel = Channel::new(connector.clone(), ChannelConfig::default());
        let context = CallContext::background();
        context.cancel();

        let call = channel.open(&PING, &context, Metadata::new());
        assert_eq!(call.status().await.code(), Code::Cancelled);
        assert_eq!(connector.connect_attempts(), 0);
        assert_eq!(channel.state(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn test_call_ids_are_unique() {
        let (connector, _listener) = memory_endpoint(1024);
        let channel = Channel::new(connector, ChannelConfig::default());
        let shared = &channel.inner.shared;

        let first = shared.allocate_id();
        let second = shared.allocate_id();
        assert_ne!(first, 0);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_register_after_shutdown_is_refused() {
        let (connector, _listener) = memory_endpoint(1024);
        let channel = Channel::new(connector, ChannelConfig::default());
        let shared = &channel.inner.shared;
        let (core, _inbound) = CallCore::new(
            shared.allocate_id(),
            PING,
            CallContext::background(),
            1024,
            no_hooks(),
        );

        // Shutdown lands between the state check in `open` and registration.
        shared.set_state(ConnectivityState::Shutdown);
        shared.fail_all(&Status::unavailable("channel closed"));

        let err = shared.register(&core).unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(channel.active_calls(), 0);
    }
}
