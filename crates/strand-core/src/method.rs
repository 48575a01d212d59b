//! Method descriptors.

use std::fmt;

/// Shape of the message flow of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingShape {
    /// One request, one response
    Unary,
    /// One request, many responses
    ServerStreaming,
    /// Many requests, one response
    ClientStreaming,
    /// Many requests, many responses
    BidiStreaming,
}

impl StreamingShape {
    /// Whether the client sends at most one message
    pub fn is_single_request(self) -> bool {
        matches!(self, Self::Unary | Self::ServerStreaming)
    }

    /// Whether the server sends at most one message
    pub fn is_single_response(self) -> bool {
        matches!(self, Self::Unary | Self::ClientStreaming)
    }
}

impl fmt::Display for StreamingShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server",
            Self::ClientStreaming => "client",
            Self::BidiStreaming => "bidirectional",
        })
    }
}

/// Immutable description of a remote method.
///
/// Stubs declare these as constants:
///
/// ```
/// use strand_core::{MethodDescriptor, StreamingShape};
///
/// const SAY_HELLO: MethodDescriptor =
///     MethodDescriptor::new("greet.v1.Greeter", "SayHello", StreamingShape::Unary);
/// assert_eq!(SAY_HELLO.path(), "/greet.v1.Greeter/SayHello");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: &'static str,
    method: &'static str,
    shape: StreamingShape,
}

impl MethodDescriptor {
    pub const fn new(service: &'static str, method: &'static str, shape: StreamingShape) -> Self {
        Self {
            service,
            method,
            shape,
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn shape(&self) -> StreamingShape {
        self.shape
    }

    /// Wire path: `/{service}/{method}`
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

/// Split a wire path into (service, method).
///
/// Accepts an optional leading slash: `/{service}/{method}`.
pub fn parse_path(path: &str) -> Option<(&str, &str)> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let (service, method) = path.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}
