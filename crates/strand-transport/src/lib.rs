//! Transport layer implementations for Strand RPC.
//!
//! The channel consumes an ordered, reliable byte stream. This crate provides
//! the traits it is written against and the implementations it ships with:
//! - Stream: any tokio `AsyncRead + AsyncWrite`
//! - TCP: connector and listener
//! - Memory: in-process connector and listener with fault injection

pub mod error;
pub mod memory;
pub mod stream;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::{Result, TransportError};
pub use memory::{memory_endpoint, MemoryConnector, MemoryListener};
pub use stream::StreamTransport;
pub use tcp::{TcpConnector, TcpConnectorBuilder, TcpTransportListener};

/// One established byte-stream connection.
///
/// Methods take `&self` so one task can block in `receive` while another
/// writes; implementations serialize each direction internally.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write all of `bytes`, in order with previous sends
    async fn send(&self, bytes: Bytes) -> Result<()>;

    /// Next chunk of received bytes; `None` at end of stream.
    ///
    /// Must be cancel-safe: dropping the future loses no data.
    async fn receive(&self) -> Result<Option<Bytes>>;

    /// Shut down the write side and release the connection
    async fn close(&self) -> Result<()>;
}

/// Produces connections to one endpoint.
///
/// Address, TLS and proxy settings live in the connector; the channel only
/// asks it for fresh connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Transport>>;

    /// Human-readable endpoint name for logs
    fn endpoint(&self) -> String;
}

/// Accepts incoming connections for a server
#[async_trait]
pub trait Listener: Send + 'static {
    async fn accept(&mut self) -> Result<Box<dyn Transport>>;
}
