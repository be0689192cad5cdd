//! Abstract radio transport.
//!
//! A [`Transport`] knows how to open a session to a radio; the resulting [`Link`]
//! is the live handle the supervisor hands out. Inbound text events are pushed
//! into the sender given to [`Transport::open`], so the subscription outlives any
//! single link: the bridge subscribes once at startup and every reconnect feeds
//! the same stream.
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::{InboundMessage, OutboundReply};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("radio did not complete handshake: {0}")]
    Handshake(String),

    #[error("link closed")]
    Closed,

    #[error("no live link")]
    NotConnected,

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("payload of {0} bytes exceeds radio frame limit")]
    PayloadTooLarge(usize),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Errors that mean the underlying link is gone (as opposed to a bad payload).
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Closed | TransportError::Timeout(_)
        )
    }
}

/// Live session to a radio.
#[async_trait]
pub trait Link: Send + Sync {
    /// Single send attempt; never retried by the caller.
    async fn send(&self, reply: &OutboundReply) -> Result<(), TransportError>;

    /// Inexpensive check that only succeeds while the link is still valid.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Release the link. Must be safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;

    /// Short human-readable description (device path, host, ...).
    fn describe(&self) -> String;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn Link>, TransportError>;

    /// Connection kind label for logs ("serial", "tcp", ...).
    fn kind(&self) -> &'static str;
}
