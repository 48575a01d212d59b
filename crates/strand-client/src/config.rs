//! Channel configuration.
//!
//! [`ChannelConfig`] holds every tunable of a channel. It has sensible
//! defaults, a builder surface on [`ChannelBuilder`](crate::ChannelBuilder),
//! and can be loaded from JSON:
//!
//! ```
//! use strand_client::ChannelConfig;
//!
//! let config = ChannelConfig::from_json(r#"{
//!     "default_timeout_ms": 2000,
//!     "reconnect_backoff": { "max_attempts": 3 },
//!     "transient_failure_policy": "fail_fast"
//! }"#).unwrap();
//! assert_eq!(config.reconnect_backoff.max_attempts, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strand_core::{Compression, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SEND_WATERMARK, MAX_FRAME_PAYLOAD};
use thiserror::Error;

/// Errors from loading or validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What happens to calls opened while the channel is in `TransientFailure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientFailurePolicy {
    /// Fail the call with `Unavailable` right away
    FailFast,
    /// Hold the call until a connection is ready, up to `max_pending_calls`
    #[default]
    Queue,
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Connection attempts per cycle before queued calls are failed
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound for any delay
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Random jitter applied to each delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            backoff_multiplier: 1.6,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of connection attempts per cycle
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set initial backoff duration
    pub fn initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Set maximum backoff duration
    pub fn max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the attempt following failed attempt number `attempt` (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_millis = self.initial_backoff.as_millis() as f64;
        let multiplier = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let backoff_millis = (base_millis * multiplier).min(self.max_backoff.as_millis() as f64);

        let jitter_factor = if self.jitter > 0.0 {
            1.0 + (rand::random::<f64>() * self.jitter * 2.0 - self.jitter)
        } else {
            1.0
        };

        let duration = Duration::from_millis((backoff_millis * jitter_factor).max(0.0) as u64);
        duration.min(self.max_backoff)
    }
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest message a call may send, before compression
    pub max_send_message_size: usize,
    /// Largest frame payload, or decompressed message, accepted from the peer
    pub max_receive_message_size: usize,
    /// Deadline applied to calls that carry none of their own
    #[serde(rename = "default_timeout_ms", with = "opt_millis")]
    pub default_timeout: Option<Duration>,
    pub reconnect_backoff: BackoffConfig,
    /// Derive outbound call contexts from `CallOptions::parent`
    pub enable_call_context_propagation: bool,
    /// Bound on a single connection attempt
    #[serde(rename = "connect_timeout_ms", with = "opt_millis")]
    pub connect_timeout: Option<Duration>,
    pub transient_failure_policy: TransientFailurePolicy,
    /// Calls that may wait for a connection at once
    pub max_pending_calls: usize,
    /// Per-call bytes that may be queued but not yet written
    pub send_buffer_watermark: usize,
    pub compression: Compression,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_send_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_receive_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_timeout: None,
            reconnect_backoff: BackoffConfig::default(),
            enable_call_context_propagation: true,
            connect_timeout: Some(Duration::from_secs(20)),
            transient_failure_policy: TransientFailurePolicy::Queue,
            max_pending_calls: 1024,
            send_buffer_watermark: DEFAULT_SEND_WATERMARK,
            compression: Compression::disabled(),
        }
    }
}

impl ChannelConfig {
    /// Parse and validate a JSON configuration; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_message_size == 0 || self.max_receive_message_size == 0 {
            return Err(ConfigError::Invalid(
                "message size limits must be non-zero".to_string(),
            ));
        }
        if self.max_send_message_size > MAX_FRAME_PAYLOAD
            || self.max_receive_message_size > MAX_FRAME_PAYLOAD
        {
            return Err(ConfigError::Invalid(format!(
                "message size limits must not exceed {} bytes",
                MAX_FRAME_PAYLOAD
            )));
        }
        if self.send_buffer_watermark == 0 {
            return Err(ConfigError::Invalid(
                "send_buffer_watermark must be non-zero".to_string(),
            ));
        }
        if self.reconnect_backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_backoff.jitter) {
            return Err(ConfigError::Invalid(
                "reconnect_backoff.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
