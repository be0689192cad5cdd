//! Reply encoding under the mesh byte ceiling.
//!
//! Replies are addressed by textual mention (`@<sender> <answer>`). When the
//! composed text does not fit, only the answer is cut, always on a UTF-8
//! character boundary, and an ASCII ellipsis is appended.
use super::types::{InboundMessage, OutboundReply};

/// Default maximum wire size of a reply. Leaves room for protocol overhead.
pub const DEFAULT_REPLY_BYTE_LIMIT: usize = 200;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy)]
pub struct ReplyEncoder {
    byte_limit: usize,
}

impl Default for ReplyEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_BYTE_LIMIT)
    }
}

impl ReplyEncoder {
    pub fn new(byte_limit: usize) -> Self {
        Self { byte_limit }
    }

    pub fn byte_limit(&self) -> usize {
        self.byte_limit
    }

    /// Compose `@{sender_id} {answer}` within the byte limit. Pure.
    pub fn encode(&self, sender_id: &str, answer: &str) -> String {
        encode_reply(sender_id, answer, self.byte_limit)
    }

    /// Build the outbound reply for an inbound message, keeping its channel.
    pub fn reply_to(&self, inbound: &InboundMessage, answer: &str) -> OutboundReply {
        OutboundReply {
            destination_id: inbound.sender_id.clone(),
            channel_index: inbound.channel_index,
            payload: self.encode(&inbound.sender_id, answer),
        }
    }
}

/// Free-function form of [`ReplyEncoder::encode`].
pub fn encode_reply(sender_id: &str, answer: &str, byte_limit: usize) -> String {
    let mention = format!("@{} ", sender_id);
    if mention.len() + answer.len() <= byte_limit {
        return format!("{}{}", mention, answer);
    }

    if mention.len() + ELLIPSIS.len() <= byte_limit {
        let budget = byte_limit - mention.len() - ELLIPSIS.len();
        let mut out = String::with_capacity(byte_limit);
        out.push_str(&mention);
        out.push_str(floor_boundary(answer, budget));
        out.push_str(ELLIPSIS);
        return out;
    }

    // Mention alone does not fit: the ceiling wins over the mention.
    let whole = format!("{}{}", mention, answer);
    if byte_limit < ELLIPSIS.len() {
        return floor_boundary(&whole, byte_limit).to_string();
    }
    let mut out = floor_boundary(&whole, byte_limit - ELLIPSIS.len()).to_string();
    out.push_str(ELLIPSIS);
    out
}

/// Longest prefix of `s` that is at most `max_bytes` long and ends on a char boundary.
fn floor_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}
