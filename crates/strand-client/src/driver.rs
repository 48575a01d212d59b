//! The connection-owning task behind a channel.
//!
//! The driver is the only place that changes the channel's connection. It
//! receives frames from calls over an unbounded command queue, holds them
//! while no connection is ready, and hands them to the writer task of the
//! current connection once one is. Each connection instance gets a
//! generation number so that failures of an old connection never touch
//! calls bound to a newer one.

use crate::channel::{ConnectivityState, Shared};
use crate::config::TransientFailurePolicy;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use strand_core::compression::decode_payload;
use strand_core::{Frame, FrameDecoder, FrameKind, SendPermit, Status};
use strand_transport::{Transport, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Bound on closing a transport during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests from channel handles and calls
pub(crate) enum Command {
    /// A new call; `head` is the JSON call head
    Start { call_id: u32, head: Bytes },
    Write(Outbound),
    /// The call ended locally; tell the peer if it knows about the call
    Reset {
        call_id: u32,
        status: Status,
        generation: Option<u64>,
    },
    Connect,
    Close { done: oneshot::Sender<()> },
}

/// An encoded frame waiting to be written
pub(crate) struct Outbound {
    pub(crate) call_id: u32,
    pub(crate) kind: FrameKind,
    pub(crate) bytes: Bytes,
    /// Send-window budget, returned once the frame is written or dropped
    pub(crate) permit: Option<SendPermit>,
}

/// Notifications from connect, reader and writer tasks
enum Event {
    Connected {
        generation: u64,
        transport: Box<dyn Transport>,
    },
    ConnectFailed {
        generation: u64,
        error: TransportError,
    },
    Lost {
        generation: u64,
        error: Option<TransportError>,
    },
    Reset {
        call_id: u32,
        status: Status,
        generation: Option<u64>,
    },
}

struct Connection {
    generation: u64,
    transport: Arc<dyn Transport>,
    writer: mpsc::UnboundedSender<Outbound>,
    tasks: Vec<AbortHandle>,
}

impl Connection {
    fn stop_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Stop the tasks and close the transport in the background
    fn release(self) {
        self.stop_tasks();
        let transport = self.transport;
        tokio::spawn(async move {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
        });
    }
}

enum Link {
    Idle,
    Connecting { generation: u64, task: AbortHandle },
    Ready(Connection),
    Backoff { until: Instant },
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    link: Link,
    /// Frames of calls not yet written to any connection, in order
    pending: VecDeque<Outbound>,
    generation: u64,
    /// Failed connection attempts in the current cycle
    attempts: u32,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            shared,
            commands,
            events,
            events_tx,
            link: Link::Idle,
            pending: VecDeque::new(),
            generation: 0,
            attempts: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(endpoint = %self.shared.connector().endpoint(), "channel driver started");
        loop {
            let retry_at = match &self.link {
                Link::Backoff { until } => Some(*until),
                _ => None,
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => {
                        self.shutdown("all channel handles dropped").await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = backoff_elapsed(retry_at) => self.start_connect(),
            }
        }
    }

    /// Returns `false` once the driver should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { call_id, head } => {
                let bytes = Frame::new(call_id, FrameKind::Headers, head).encode();
                self.route(Outbound {
                    call_id,
                    kind: FrameKind::Headers,
                    bytes,
                    permit: None,
                });
            }
            Command::Write(outbound) => self.route(outbound),
            Command::Reset {
                call_id,
                status,
                generation,
            } => self.reset(call_id, &status, generation),
            Command::Connect => {
                if matches!(self.link, Link::Idle) {
                    self.start_connect();
                }
            }
            Command::Close { done } => {
                self.shutdown("channel closed").await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                generation,
                transport,
            } => self.on_connected(generation, transport),
            Event::ConnectFailed { generation, error } => self.on_connect_failed(generation, error),
            Event::Lost { generation, error } => self.on_lost(generation, error),
            Event::Reset {
                call_id,
                status,
                generation,
            } => self.reset(call_id, &status, generation),
        }
    }

    /// Write `outbound` now, queue it for the next connection, or refuse the call
    fn route(&mut self, outbound: Outbound) {
        if !self.shared.is_active(outbound.call_id) {
            // Ended before it reached the wire; dropping returns its budget.
            return;
        }

        if let Link::Ready(conn) = &self.link {
            if outbound.kind == FrameKind::Headers {
                self.shared.bind(outbound.call_id, conn.generation);
            }
            // A closed writer means a `Lost` event is on its way.
            let _ = conn.writer.send(outbound);
            return;
        }

        if outbound.kind == FrameKind::Headers {
            if let Err(status) = self.admit() {
                self.shared.complete(outbound.call_id, status);
                return;
            }
        }
        self.pending.push_back(outbound);
        if matches!(self.link, Link::Idle) {
            self.start_connect();
        }
    }

    /// Whether another call may wait for a connection
    fn admit(&self) -> Result<(), Status> {
        let policy = self.shared.config().transient_failure_policy;
        if matches!(self.link, Link::Backoff { .. }) && policy == TransientFailurePolicy::FailFast {
            return Err(Status::unavailable("channel is in transient failure"));
        }
        let waiting = self.pending_calls();
        if waiting >= self.shared.config().max_pending_calls {
            return Err(Status::unavailable(format!(
                "{} calls already waiting for a connection",
                waiting
            )));
        }
        Ok(())
    }

    fn pending_calls(&self) -> usize {
        self.pending
            .iter()
            .filter(|o| o.kind == FrameKind::Headers && self.shared.is_active(o.call_id))
            .count()
    }

    fn fail_pending(&mut self, status: &Status) {
        for outbound in self.pending.drain(..) {
            if outbound.kind == FrameKind::Headers {
                self.shared.complete(outbound.call_id, status.clone());
            }
        }
    }

    fn reset(&mut self, call_id: u32, status: &Status, generation: Option<u64>) {
        self.pending.retain(|o| o.call_id != call_id);
        let Link::Ready(conn) = &self.link else {
            return;
        };
        if generation != Some(conn.generation) {
            return;
        }
        trace!(call_id, code = %status.code(), "resetting call");
        let _ = conn.writer.send(Outbound {
            call_id,
            kind: FrameKind::Reset,
            bytes: Frame::reset(call_id, status).encode(),
            permit: None,
        });
    }

    fn start_connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let connector = Arc::clone(self.shared.connector());
        let timeout = self.shared.config().connect_timeout;
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let attempt = connector.connect();
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or_else(|_| Err(TransportError::ConnectTimeout)),
                None => attempt.await,
            };
            let event = match result {
                Ok(transport) => Event::Connected {
                    generation,
                    transport,
                },
                Err(error) => Event::ConnectFailed { generation, error },
            };
            let _ = events.send(event);
        });

        self.link = Link::Connecting {
            generation,
            task: task.abort_handle(),
        };
        self.shared.set_state(ConnectivityState::Connecting);
    }

    fn on_connected(&mut self, generation: u64, transport: Box<dyn Transport>) {
        if !matches!(self.link, Link::Connecting { generation: current, .. } if current == generation)
        {
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
            return;
        }

        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (writer, queue) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            Arc::clone(&transport),
            generation,
            self.events_tx.clone(),
        ));
        let writer_task = tokio::spawn(write_loop(
            Arc::clone(&self.shared),
            Arc::clone(&transport),
            generation,
            queue,
            self.events_tx.clone(),
        ));

        self.attempts = 0;
        self.link = Link::Ready(Connection {
            generation,
            transport,
            writer,
            tasks: vec![reader.abort_handle(), writer_task.abort_handle()],
        });
        self.shared.set_state(ConnectivityState::Ready);
        info!(
            endpoint = %self.shared.connector().endpoint(),
            generation,
            queued = self.pending.len(),
            "connected"
        );

        for outbound in std::mem::take(&mut self.pending) {
            self.route(outbound);
        }
    }

    fn on_connect_failed(&mut self, generation: u64, error: TransportError) {
        if !matches!(self.link, Link::Connecting { generation: current, .. } if current == generation)
        {
            return;
        }

        self.attempts += 1;
        let backoff = self.shared.config().reconnect_backoff.clone();
        warn!(
            endpoint = %self.shared.connector().endpoint(),
            attempt = self.attempts,
            max_attempts = backoff.max_attempts,
            error = %error,
            "connection attempt failed"
        );
        self.shared.set_state(ConnectivityState::TransientFailure);

        if self.attempts >= backoff.max_attempts {
            self.fail_pending(&Status::unavailable(format!(
                "failed to connect after {} attempts: {}",
                self.attempts, error
            )));
            self.attempts = 0;
            self.link = Link::Idle;
            self.shared.set_state(ConnectivityState::Idle);
            return;
        }

        if self.shared.config().transient_failure_policy == TransientFailurePolicy::FailFast {
            self.fail_pending(&Status::unavailable(format!("failed to connect: {}", error)));
        }
        let delay = backoff.backoff_duration(self.attempts - 1);
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        self.link = Link::Backoff {
            until: Instant::now() + delay,
        };
    }

    fn on_lost(&mut self, generation: u64, error: Option<TransportError>) {
        match &self.link {
            Link::Ready(conn) if conn.generation == generation => {}
            _ => return,
        }
        if let Link::Ready(conn) = std::mem::replace(&mut self.link, Link::Idle) {
            conn.release();
        }

        let reason = match error {
            Some(error) => format!("connection lost: {}", error),
            None => "connection closed by peer".to_string(),
        };
        let failed = self
            .shared
            .fail_generation(generation, &Status::unavailable(reason.clone()));
        warn!(
            endpoint = %self.shared.connector().endpoint(),
            generation,
            failed_calls = failed,
            "{}",
            reason
        );

        self.shared.set_state(ConnectivityState::TransientFailure);
        if self.pending_calls() > 0 {
            self.start_connect();
        } else {
            self.shared.set_state(ConnectivityState::Idle);
        }
    }

    async fn shutdown(&mut self, reason: &str) {
        self.shared.set_state(ConnectivityState::Shutdown);
        self.pending.clear();
        let failed = self.shared.fail_all(&Status::unavailable(reason));

        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Ready(conn) => {
                conn.stop_tasks();
                match tokio::time::timeout(CLOSE_TIMEOUT, conn.transport.close()).await {
                    Ok(Err(error)) => debug!(%error, "error closing transport"),
                    Err(_) => debug!("timed out closing transport"),
                    Ok(Ok(())) => {}
                }
            }
            Link::Connecting { task, .. } => task.abort(),
            Link::Idle | Link::Backoff { .. } => {}
        }
        info!(
            endpoint = %self.shared.connector().endpoint(),
            failed_calls = failed,
            reason,
            "channel shut down"
        );
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Also reached when the driver panics: no call may wait forever.
        self.shared.set_state(ConnectivityState::Shutdown);
        self.shared
            .fail_all(&Status::unavailable("channel driver stopped"));
        match &self.link {
            Link::Ready(conn) => conn.stop_tasks(),
            Link::Connecting { task, .. } => task.abort(),
            Link::Idle | Link::Backoff { .. } => {}
        }
    }
}

async fn backoff_elapsed(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Decode inbound frames and route them to their calls
async fn read_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    let max_size = shared.config().max_receive_message_size;
    let mut decoder = FrameDecoder::new(max_size);

    let error = loop {
        let chunk = match transport.receive().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break None,
            Err(error) => break Some(error),
        };
        decoder.feed(&chunk);

        loop {
            match decoder.decode() {
                Ok(Some(frame)) => dispatch(&shared, frame, max_size, &events),
                Ok(None) => break,
                Err(error) => {
                    warn!(call_id = error.call_id(), %error, "rejected inbound frame");
                    abort(&shared, &events, error.call_id(), error.into());
                }
            }
        }
    };

    let _ = events.send(Event::Lost { generation, error });
}

fn dispatch(shared: &Shared, frame: Frame, max_size: usize, events: &mpsc::UnboundedSender<Event>) {
    let call_id = frame.call_id;
    let Some(core) = shared.lookup(call_id) else {
        trace!(call_id, kind = ?frame.kind, "frame for unknown call");
        return;
    };

    match frame.kind {
        FrameKind::Message => {
            let delivered = decode_payload(frame.payload, frame.compressed, max_size)
                .and_then(|message| core.deliver(message));
            if let Err(status) = delivered {
                abort(shared, events, call_id, status);
            }
        }
        FrameKind::Trailers => {
            let status = Status::from_json(&frame.payload);
            let status = if status.is_ok() {
                core.remote_closed().map(|()| status).unwrap_or_else(|violation| violation)
            } else {
                status
            };
            shared.complete(call_id, status);
        }
        FrameKind::Reset => {
            let status = Status::from_json(&frame.payload);
            let status = if status.is_ok() {
                Status::cancelled("call reset by peer")
            } else {
                status
            };
            shared.complete(call_id, status);
        }
        FrameKind::Headers | FrameKind::HalfClose => {
            trace!(call_id, kind = ?frame.kind, "ignoring frame");
        }
    }
}

/// Fail a call from the reader and have the driver reset it on the wire
fn abort(shared: &Shared, events: &mpsc::UnboundedSender<Event>, call_id: u32, status: Status) {
    if let Some(generation) = shared.complete(call_id, status.clone()) {
        let _ = events.send(Event::Reset {
            call_id,
            status,
            generation,
        });
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    generation: u64,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(outbound) = queue.recv().await {
        let Outbound {
            call_id,
            kind,
            bytes,
            permit,
        } = outbound;
        if kind != FrameKind::Reset && !shared.is_active(call_id) {
            continue;
        }
        if let Err(error) = transport.send(bytes).await {
            let _ = events.send(Event::Lost {
                generation,
                error: Some(error),
            });
            return;
        }
        drop(permit);
    }
}
