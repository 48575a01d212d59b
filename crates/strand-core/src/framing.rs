//! Frame codec for multiplexed calls.
//!
//! Frame format:
//! `[call id: u32 BE][kind: u8][compression flag: u8][length: u32 BE][payload]`
//!
//! The trailing flag + length pair is the usual length-prefixed message
//! convention; the call id and kind let many calls share one byte stream.

use crate::error::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default maximum payload size (4MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Largest payload the four-byte length field can describe
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Bytes preceding every payload
pub const HEADER_LEN: usize = 10;

/// Kind of a frame, byte 4 of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a call: JSON call head (path, timeout, metadata)
    Headers = 1,
    /// One message of a half-stream
    Message = 2,
    /// Client finished sending
    HalfClose = 3,
    /// Server finished: JSON status, ends the call
    Trailers = 4,
    /// Abort the call in either direction: JSON status
    Reset = 5,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Headers),
            2 => Some(Self::Message),
            3 => Some(Self::HalfClose),
            4 => Some(Self::Trailers),
            5 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// A frame belonging to one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub call_id: u32,
    pub kind: FrameKind,
    pub compressed: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(call_id: u32, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            call_id,
            kind,
            compressed: false,
            payload,
        }
    }

    /// Create a message frame
    pub fn message(call_id: u32, payload: Bytes, compressed: bool) -> Self {
        Self {
            call_id,
            kind: FrameKind::Message,
            compressed,
            payload,
        }
    }

    /// Create a half-close frame
    pub fn half_close(call_id: u32) -> Self {
        Self::new(call_id, FrameKind::HalfClose, Bytes::new())
    }

    /// Create a trailers frame carrying the terminal status
    pub fn trailers(call_id: u32, status: &Status) -> Self {
        Self::new(call_id, FrameKind::Trailers, status_payload(status))
    }

    /// Create a reset frame
    pub fn reset(call_id: u32, status: &Status) -> Self {
        Self::new(call_id, FrameKind::Reset, status_payload(status))
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode this frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.call_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(u8::from(self.compressed));
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

fn status_payload(status: &Status) -> Bytes {
    // Serializing a status (strings and an integer) cannot fail.
    status.to_json().map(Bytes::from).unwrap_or_default()
}

/// Decode failures. Both variants name the call they belong to; the decoder
/// has already skipped the offending payload and stays usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame for call {call_id} too large: {len} bytes (max {max})")]
    TooLarge { call_id: u32, len: usize, max: usize },

    #[error("corrupt frame for call {call_id}: {reason}")]
    Corrupt { call_id: u32, reason: String },
}

impl FrameError {
    pub fn call_id(&self) -> u32 {
        match self {
            FrameError::TooLarge { call_id, .. } | FrameError::Corrupt { call_id, .. } => *call_id,
        }
    }
}

impl From<FrameError> for Status {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::TooLarge { .. } => Status::new(Code::ResourceExhausted, e.to_string()),
            FrameError::Corrupt { .. } => Status::new(Code::Internal, e.to_string()),
        }
    }
}

/// Incremental frame decoder.
///
/// Bytes are fed as the transport delivers them; `decode` yields complete
/// frames and never blocks. Payloads of rejected frames are dropped as they
/// arrive instead of being buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload: usize,
    skip: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_payload,
            skip: 0,
        }
    }

    /// Add data to the decoder buffer
    pub fn feed(&mut self, data: &[u8]) {
        if self.skip > 0 {
            let dropped = self.skip.min(data.len());
            self.skip -= dropped;
            self.buffer.extend_from_slice(&data[dropped..]);
        } else {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode one frame; `Ok(None)` means more data is needed
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.skip > 0 || self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buffer[..HEADER_LEN];
        let call_id = header.get_u32();
        let kind = header.get_u8();
        let flag = header.get_u8();
        let len = header.get_u32() as usize;

        if len > self.max_payload {
            self.discard(len);
            return Err(FrameError::TooLarge {
                call_id,
                len,
                max: self.max_payload,
            });
        }

        let Some(kind) = FrameKind::from_u8(kind) else {
            self.discard(len);
            return Err(FrameError::Corrupt {
                call_id,
                reason: format!("unknown frame kind {}", kind),
            });
        };
        let compressed = match flag {
            0 => false,
            1 => true,
            other => {
                self.discard(len);
                return Err(FrameError::Corrupt {
                    call_id,
                    reason: format!("invalid compression flag {}", other),
                });
            }
        };

        if self.buffer.len() < HEADER_LEN + len {
            // Grow once for the rest of the frame rather than per chunk.
            self.buffer.reserve(HEADER_LEN + len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();

        Ok(Some(Frame {
            call_id,
            kind,
            compressed,
            payload,
        }))
    }

    /// Drop the header and `len` payload bytes, including ones not received yet
    fn discard(&mut self, len: usize) {
        self.buffer.advance(HEADER_LEN);
        let available = self.buffer.len().min(len);
        self.buffer.advance(available);
        self.skip = len - available;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::message(7, Bytes::from("hello"), false);
        let encoded = original.encode();
        assert_eq!(encoded.len(), HEADER_LEN + 5);
        assert_eq!(&encoded[5..10], &[0, 0, 0, 0, 5]);

        let mut decoder = FrameDecoder::default();
        decoder.feed(&encoded);

        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_partial_reads() {
        let mut bytes = BytesMut::new();
        Frame::message(1, Bytes::from("first"), false).encode_into(&mut bytes);
        Frame::half_close(1).encode_into(&mut bytes);
        Frame::message(2, Bytes::from("second"), true).encode_into(&mut bytes);

        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for byte in bytes.iter() {
            decoder.feed(std::slice::from_ref(byte));
            while let Some(frame) = decoder.decode().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, Bytes::from("first"));
        assert_eq!(frames[1].kind, FrameKind::HalfClose);
        assert_eq!(frames[2].call_id, 2);
        assert!(frames[2].compressed);
    }

    #[test]
    fn test_oversized_frame_is_skipped_without_buffering() {
        let mut decoder = FrameDecoder::new(16);

        // Header claiming a huge payload; only a sliver of it arrives at first.
        let mut header = BytesMut::new();
        header.put_u32(3);
        header.put_u8(FrameKind::Message as u8);
        header.put_u8(0);
        header.put_u32(u32::MAX);
        decoder.feed(&header);
        decoder.feed(&[0xAB; 8]);

        let err = decoder.decode().unwrap_err();
        assert_eq!(err.call_id(), 3);
        assert!(matches!(err, FrameError::TooLarge { max: 16, .. }));
        assert_eq!(Status::from(err).code(), Code::ResourceExhausted);
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.buffer.capacity() < 1024);

        // Still skipping: nothing decodes while the claimed payload streams past.
        decoder.feed(&[0xAB; 64]);
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_recovers_after_oversized_frame() {
        let mut decoder = FrameDecoder::new(4);
        let mut bytes = BytesMut::new();
        Frame::message(1, Bytes::from("too long"), false).encode_into(&mut bytes);
        Frame::message(2, Bytes::from("ok"), false).encode_into(&mut bytes);
        decoder.feed(&bytes);

        assert!(matches!(
            decoder.decode(),
            Err(FrameError::TooLarge { call_id: 1, .. })
        ));
        let next = decoder.decode().unwrap().unwrap();
        assert_eq!(next.call_id, 2);
        assert_eq!(next.payload, Bytes::from("ok"));
    }

    #[test]
    fn test_corrupt_kind_and_flag() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(9);
        bytes.put_u8(42);
        bytes.put_u8(0);
        bytes.put_u32(2);
        bytes.put_slice(b"xx");
        bytes.put_u32(10);
        bytes.put_u8(FrameKind::Message as u8);
        bytes.put_u8(7);
        bytes.put_u32(1);
        bytes.put_slice(b"y");
        Frame::half_close(11).encode_into(&mut bytes);

        let mut decoder = FrameDecoder::default();
        decoder.feed(&bytes);

        let err = decoder.decode().unwrap_err();
        assert_eq!(err.call_id(), 9);
        assert_eq!(Status::from(err).code(), Code::Internal);

        let err = decoder.decode().unwrap_err();
        assert_eq!(err.call_id(), 10);

        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.call_id, 11);
    }

    #[test]
    fn test_trailers_carry_status() {
        let status = Status::internal("boom");
        let frame = Frame::trailers(5, &status);
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame.encode());
        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Trailers);
        assert_eq!(Status::from_json(&decoded.payload), status);
    }
}
