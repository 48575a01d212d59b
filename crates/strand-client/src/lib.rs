//! Client side of the Strand RPC framework.
//!
//! This crate provides:
//! - [`Channel`]: one connection multiplexing many concurrent calls, with a
//!   connectivity state machine and bounded reconnect backoff
//! - [`Call`]: the untyped lifecycle of one call (request half, response
//!   half, terminal status)
//! - [`Client`]: typed unary and streaming calls over prost messages
//! - [`Interceptor`]: hooks around call creation, messages and completion

pub mod call;
pub mod channel;
pub mod client;
pub mod config;
mod driver;
pub mod interceptor;

pub use call::{Call, CallReceiver, CallSender};
pub use channel::{Channel, ChannelBuilder, ConnectivityState};
pub use client::{CallOptions, Client, Sender, Streaming};
pub use config::{BackoffConfig, ChannelConfig, ConfigError, TransientFailurePolicy};
pub use interceptor::{CallStart, Interceptor, MetadataInterceptor, Next, TracingInterceptor};

pub use strand_core::{CallContext, Code, Metadata, MethodDescriptor, Status, StreamingShape};
