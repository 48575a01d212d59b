//! Core types and utilities for the Strand RPC channel.
//!
//! This crate provides the foundation types used across all Strand components:
//! - Status codes and the terminal call status
//! - Deadline and cancellation contexts
//! - Frame codec for multiplexed calls
//! - Per-call stream state machine
//! - Send-side back-pressure
//! - Method descriptors and call metadata

pub mod compression;
pub mod context;
pub mod error;
pub mod flow_control;
pub mod framing;
pub mod head;
pub mod metadata;
pub mod method;
pub mod stream;

pub use compression::Compression;
pub use context::{CallContext, Signal};
pub use error::{Code, Status};
pub use flow_control::{SendPermit, SendWindow, DEFAULT_SEND_WATERMARK};
pub use framing::{
    Frame, FrameDecoder, FrameError, FrameKind, DEFAULT_MAX_MESSAGE_SIZE, MAX_FRAME_PAYLOAD,
};
pub use head::CallHead;
pub use metadata::Metadata;
pub use method::{parse_path, MethodDescriptor, StreamingShape};
pub use stream::{StreamState, StreamStateMachine};
