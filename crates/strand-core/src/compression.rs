//! zstd message compression.

use crate::error::Status;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression level for zstd
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Minimum message size to compress (in bytes)
pub const MIN_COMPRESS_SIZE: usize = 1024; // 1KB

/// Compress bytes using zstd
pub fn compress_zstd(data: &[u8], level: i32) -> Result<Bytes, Status> {
    zstd::encode_all(data, level)
        .map(Bytes::from)
        .map_err(|e| Status::internal(format!("Compression failed: {}", e)))
}

/// Decompress bytes using zstd, refusing output larger than `max_size`
pub fn decompress_zstd(data: &[u8], max_size: usize) -> Result<Bytes, Status> {
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| Status::internal(format!("Decompression failed: {}", e)))?;

    let mut out = Vec::new();
    decoder
        .take(max_size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Status::internal(format!("Decompression failed: {}", e)))?;

    if out.len() > max_size {
        return Err(Status::resource_exhausted(format!(
            "decompressed message exceeds {} bytes",
            max_size
        )));
    }
    Ok(Bytes::from(out))
}

/// Outgoing compression settings for one side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Compression {
    pub enabled: bool,
    pub level: i32,
    pub min_size: usize,
}

impl Compression {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            level: DEFAULT_COMPRESSION_LEVEL,
            min_size: MIN_COMPRESS_SIZE,
        }
    }

    pub fn zstd() -> Self {
        Self {
            enabled: true,
            ..Self::disabled()
        }
    }

    /// Compress `payload` if enabled and large enough; returns the bytes and the wire flag
    pub fn apply(&self, payload: Bytes) -> Result<(Bytes, bool), Status> {
        if !self.enabled || payload.len() < self.min_size {
            return Ok((payload, false));
        }
        let compressed = compress_zstd(&payload, self.level)?;
        if compressed.len() >= payload.len() {
            return Ok((payload, false));
        }
        Ok((compressed, true))
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Undo [`Compression::apply`] on the receiving side
pub fn decode_payload(payload: Bytes, compressed: bool, max_size: usize) -> Result<Bytes, Status> {
    if compressed {
        decompress_zstd(&payload, max_size)
    } else {
        Ok(payload)
    }
}
