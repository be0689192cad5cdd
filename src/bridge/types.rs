//! Value types shared by the bridge components.
//!
//! Everything here is plain data: the connection state enum owned by the
//! supervisor, the inbound/outbound message values that travel between the
//! transport and the router, and the retry policy applied by both the query
//! client and the reconnect loop.
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the single logical radio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded text event received from the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Opaque sender identifier, e.g. `!a1b2c3d4`.
    pub sender_id: String,
    /// Channel index the message arrived on (0 = primary).
    pub channel_index: u32,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(sender_id: impl Into<String>, channel_index: u32, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            channel_index,
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// A reply ready for a single send attempt.
///
/// Only [`crate::bridge::ReplyEncoder`] builds these, so `payload` always fits the
/// configured byte ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub destination_id: String,
    pub channel_index: u32,
    pub(crate) payload: String,
}

impl OutboundReply {
    pub fn text(&self) -> &str {
        &self.payload
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    pub fn byte_len(&self) -> usize {
        self.payload.len()
    }
}

/// Bounded retry configuration. Read-only after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_between_attempts: Duration,
}

impl RetryPolicy {
    /// A policy always allows at least one attempt.
    pub fn new(max_attempts: u32, delay_between_attempts: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_between_attempts,
        }
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Result of a single backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(String),
    Retryable(String),
    Terminal(String),
}

/// Transient record of one call to the backend; lives only for one `ask`.
#[derive(Debug, Clone)]
pub struct QueryAttempt {
    pub prompt: String,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}
