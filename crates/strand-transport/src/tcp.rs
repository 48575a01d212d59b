//! TCP connector and listener.

use crate::error::{Result, TransportError};
use crate::stream::StreamTransport;
use crate::{Connector, Listener, Transport};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Connects to one TCP address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: SocketAddr,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpConnector {
    /// Connector with no connect timeout and `TCP_NODELAY` set
    pub fn new(address: SocketAddr) -> Self {
        Self::builder(address).build()
    }

    pub fn builder(address: SocketAddr) -> TcpConnectorBuilder {
        TcpConnectorBuilder::new(address)
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    async fn dial(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect(self.address);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| TransportError::ConnectTimeout)?,
            None => connect.await,
        }
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                TransportError::Refused(self.address.to_string())
            }
            _ => TransportError::Io(e),
        })?;

        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let stream = self.dial().await?;
        debug!(peer = %self.address, "tcp connection established");
        Ok(Box::new(StreamTransport::new(stream)))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Builder for [`TcpConnector`]
#[derive(Debug, Clone)]
pub struct TcpConnectorBuilder {
    address: SocketAddr,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpConnectorBuilder {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connect_timeout: None,
            nodelay: true,
        }
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    pub fn build(self) -> TcpConnector {
        TcpConnector {
            address: self.address,
            connect_timeout: self.connect_timeout,
            nodelay: self.nodelay,
        }
    }
}

/// TCP listener for accepting incoming connections
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&mut self) -> Result<Box<dyn Transport>> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(Box::new(StreamTransport::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_tcp_connect_and_exchange() {
        let mut listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let got = conn.receive().await.unwrap().unwrap();
            conn.send(got).await.unwrap();
        });

        let connector = TcpConnector::builder(addr)
            .connect_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(connector.endpoint(), format!("tcp://{}", addr));

        let conn = connector.connect().await.unwrap();
        conn.send(Bytes::from_static(b"echo")).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 4 {
            echoed.extend_from_slice(&conn.receive().await.unwrap().unwrap());
        }
        assert_eq!(&echoed[..], b"echo");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_refused() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let err = TcpConnector::new(addr).connect().await.err().unwrap();
        assert!(matches!(
            err,
            TransportError::Refused(_) | TransportError::Io(_)
        ));
    }
}
