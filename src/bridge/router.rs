//! Inbound message routing.
//!
//! Every inbound text event passes through [`MessageRouter::handle`]. Messages
//! that carry the command prefix are answered on a spawned task: query the
//! model, encode the reply, make a single send attempt. Nothing here retries a
//! send; a failure is logged and counted.
use log::{debug, error, info};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use super::query::QueryClient;
use super::reply::ReplyEncoder;
use super::supervisor::ConnectionSupervisor;
use super::types::InboundMessage;
use crate::config::BridgeConfig;
use crate::logutil::preview;
use crate::metrics::BridgeStats;

pub struct MessageRouter {
    prefix: String,
    ai_enabled: bool,
    encoder: ReplyEncoder,
    query: Arc<QueryClient>,
    supervisor: Arc<ConnectionSupervisor>,
    stats: Arc<BridgeStats>,
    tasks: TaskTracker,
}

impl MessageRouter {
    pub fn new(
        prefix: impl Into<String>,
        encoder: ReplyEncoder,
        query: Arc<QueryClient>,
        supervisor: Arc<ConnectionSupervisor>,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            ai_enabled: true,
            encoder,
            query,
            supervisor,
            stats,
            tasks: TaskTracker::new(),
        }
    }

    pub fn from_config(
        cfg: &BridgeConfig,
        query: Arc<QueryClient>,
        supervisor: Arc<ConnectionSupervisor>,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self::new(
            cfg.command_prefix.clone(),
            ReplyEncoder::new(cfg.reply_byte_limit),
            query,
            supervisor,
            stats,
        )
        .with_ai_enabled(cfg.ai_enabled)
    }

    pub fn with_ai_enabled(mut self, enabled: bool) -> Self {
        self.ai_enabled = enabled;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of queries still being answered.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Route one inbound message.
    ///
    /// Returns the handle of the spawned answer task when the message was a
    /// query, `None` when it was ignored.
    pub fn handle(&self, inbound: InboundMessage) -> Option<JoinHandle<()>> {
        let text = inbound.text.trim();
        if text.is_empty() {
            return None;
        }
        let state = self.supervisor.current_state();
        if !state.is_connected() {
            debug!(
                "dropping message from {} while link is {}",
                inbound.sender_id, state
            );
            return None;
        }

        self.stats.inc_received();
        info!(
            "From {} (ch {}): {}",
            inbound.sender_id,
            inbound.channel_index,
            preview(text, 160)
        );

        if !self.ai_enabled {
            return None;
        }
        let question = extract_question(text, &self.prefix)?.to_string();
        self.stats.inc_matched();
        info!(
            "AI query from {} on channel {}: {}",
            inbound.sender_id,
            inbound.channel_index,
            preview(&question, 160)
        );

        let query = Arc::clone(&self.query);
        let supervisor = Arc::clone(&self.supervisor);
        let stats = Arc::clone(&self.stats);
        let encoder = self.encoder;
        Some(self.tasks.spawn(async move {
            let report = query.ask_detailed(&question).await;
            if !report.is_success() {
                stats.inc_query_errors();
            }
            let reply = encoder.reply_to(&inbound, &report.answer);
            info!(
                "Preparing reply on channel {} ({} bytes): {}",
                reply.channel_index,
                reply.byte_len(),
                preview(reply.text(), 160)
            );
            match supervisor.send(&reply).await {
                Ok(()) => {
                    stats.inc_replies_sent();
                    info!("Reply sent on channel {}", reply.channel_index);
                }
                Err(e) => {
                    stats.inc_send_failures();
                    error!(
                        "Send failed for reply to {} on channel {}: {}",
                        reply.destination_id, reply.channel_index, e
                    );
                }
            }
        }))
    }

    /// Stop accepting work and wait for in-flight queries to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// The question after a case-insensitive `prefix`, trimmed. `None` when the
/// prefix is absent or nothing follows it.
pub fn extract_question<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.to_lowercase() != prefix.to_lowercase() {
        return None;
    }
    let question = text[prefix.len()..].trim();
    if question.is_empty() {
        None
    } else {
        Some(question)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_case_insensitively() {
        assert_eq!(extract_question("/ai what time is it?", "/AI"), Some("what time is it?"));
        assert_eq!(extract_question("/Ai   spaced  ", "/AI"), Some("spaced"));
    }

    #[test]
    fn prefix_only_or_missing_is_ignored() {
        assert_eq!(extract_question("/AI", "/AI"), None);
        assert_eq!(extract_question("/AI    ", "/AI"), None);
        assert_eq!(extract_question("hello /AI there", "/AI"), None);
        assert_eq!(extract_question("/A", "/AI"), None);
    }

    #[test]
    fn multibyte_text_near_prefix_does_not_panic() {
        // byte 3 falls inside the second character
        assert_eq!(extract_question("ééé", "/AI"), None);
    }
}
