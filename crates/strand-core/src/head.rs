//! Call head: the payload of a `Headers` frame.

use crate::error::Status;
use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the peer needs to route and bound a new call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHead {
    /// `/{service}/{method}`
    pub path: String,

    /// Time left until the caller's deadline, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl CallHead {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            timeout_ms: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        // Round up so a sub-millisecond budget is not sent as "no time left".
        self.timeout_ms = timeout.map(|t| {
            let ms = t.as_millis();
            let ms = if t.subsec_nanos() % 1_000_000 != 0 { ms + 1 } else { ms };
            ms.min(u64::MAX as u128) as u64
        });
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Status> {
        serde_json::to_vec(self).map_err(|e| Status::internal(format!("encode call head: {}", e)))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, Status> {
        serde_json::from_slice(bytes)
            .map_err(|e| Status::internal(format!("malformed call head: {}", e)))
    }
}
