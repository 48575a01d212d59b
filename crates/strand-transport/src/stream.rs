//! Transport over any tokio byte stream.

use crate::error::{Result, TransportError};
use crate::Transport;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Default size of a single read
pub const DEFAULT_READ_CHUNK: usize = 16 * 1024;

/// Byte-stream transport over a split `AsyncRead + AsyncWrite`
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    read_chunk: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self::with_read_chunk(stream, DEFAULT_READ_CHUNK)
    }

    pub fn with_read_chunk(stream: S, read_chunk: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_chunk: read_chunk.max(1),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, bytes: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.read_chunk);
        // `read_buf` is cancel-safe, so this whole future is.
        let n = reader.read_buf(&mut buf).await.map_err(map_io)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // Peer already gone: nothing left to release.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn map_io(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
            TransportError::ConnectionClosed
        }
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
            TransportError::ConnectionReset
        }
        _ => TransportError::Io(e),
    }
}
