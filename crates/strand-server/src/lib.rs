//! Server peer for the Strand RPC channel.
//!
//! Kept deliberately small: it speaks the frame protocol well enough to
//! serve the four call shapes, honour the caller's deadline and react to
//! resets. This crate provides:
//! - Method router with typed registration for every call shape
//! - Handler request/response types
//! - Connection runtime over any strand transport

pub mod handler;
pub mod router;
pub mod server;

pub use handler::{RawRequestStream, RequestContext, RequestStream, ResponseStream, RpcResponse};
pub use router::{Route, Router};
pub use server::{Server, ServerBuilder, ServerConfig};
