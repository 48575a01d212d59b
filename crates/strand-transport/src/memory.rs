//! In-process transport.
//!
//! Connections are `tokio::io::duplex` pipes handed from a [`MemoryConnector`]
//! to its [`MemoryListener`]. The connector can sever every open connection
//! or refuse new ones, which makes connection-loss paths testable without
//! sockets.

use crate::error::{Result, TransportError};
use crate::stream::StreamTransport;
use crate::{Connector, Listener, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Default pipe capacity in bytes
pub const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

struct Shared {
    incoming: mpsc::UnboundedSender<Box<dyn Transport>>,
    epoch: watch::Sender<u64>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
    buffer: usize,
}

/// Create a connected connector/listener pair
pub fn memory_endpoint(buffer: usize) -> (MemoryConnector, MemoryListener) {
    let (incoming, rx) = mpsc::unbounded_channel();
    let (epoch, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        incoming,
        epoch,
        refusing: AtomicBool::new(false),
        attempts: AtomicUsize::new(0),
        buffer: buffer.max(1),
    });
    (MemoryConnector { shared }, MemoryListener { incoming: rx })
}

/// Client side of an in-process endpoint
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Break every connection opened so far; both ends see `ConnectionReset`
    pub fn sever_all(&self) {
        self.shared.epoch.send_modify(|e| *e += 1);
        debug!("memory endpoint severed");
    }

    /// Make subsequent `connect` calls fail with `Refused`
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `connect` calls made, including refused ones
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(self.endpoint()));
        }

        let (client, server) = tokio::io::duplex(self.shared.buffer);
        let server = MemoryTransport::new(server, Arc::clone(&self.shared));
        self.shared
            .incoming
            .send(Box::new(server))
            .map_err(|_| TransportError::Refused(self.endpoint()))?;

        Ok(Box::new(MemoryTransport::new(client, Arc::clone(&self.shared))))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

/// Server side of an in-process endpoint
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Box<dyn Transport>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Box<dyn Transport>> {
        self.incoming
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }
}

/// One end of an in-process connection
pub struct MemoryTransport {
    inner: StreamTransport<DuplexStream>,
    shared: Arc<Shared>,
    epoch: u64,
}

impl MemoryTransport {
    fn new(stream: DuplexStream, shared: Arc<Shared>) -> Self {
        let epoch = *shared.epoch.borrow();
        Self {
            inner: StreamTransport::new(stream),
            shared,
            epoch,
        }
    }

    fn check_severed(&self) -> Result<()> {
        if *self.shared.epoch.borrow() != self.epoch {
            return Err(TransportError::ConnectionReset);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, bytes: Bytes) -> Result<()> {
        self.check_severed()?;
        let mut severed = self.shared.epoch.subscribe();
        tokio::select! {
            res = self.inner.send(bytes) => res,
            _ = severed.wait_for(|e| *e != self.epoch) => Err(TransportError::ConnectionReset),
        }
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.check_severed()?;
        let mut severed = self.shared.epoch.subscribe();
        tokio::select! {
            res = self.inner.receive() => res,
            _ = severed.wait_for(|e| *e != self.epoch) => Err(TransportError::ConnectionReset),
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
