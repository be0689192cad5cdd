//! Meshtastic stream API framing: `0x94 0xC3 len_hi len_lo <protobuf>`.
//!
//! Serial ports also carry boot text and debug logs between frames, so the
//! decoder resynchronises on the magic bytes and drops anything in between.
use bytes::{Buf, Bytes, BytesMut};
use prost::Message;

use super::proto::ToRadio;
use crate::bridge::TransportError;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;
/// Largest payload the firmware will ever send or accept on the stream API.
pub const MAX_FRAME_PAYLOAD: usize = 512;

#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
    discarded: usize,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes dropped while searching for a header.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded
    }

    fn skip(&mut self, n: usize) {
        self.buf.advance(n);
        self.discarded += n;
    }

    /// Next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.buf.iter().position(|&b| b == START1) {
                None => {
                    let n = self.buf.len();
                    self.skip(n);
                    return None;
                }
                Some(pos) if pos > 0 => self.skip(pos),
                Some(_) => {}
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.skip(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let declared = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if declared == 0 || declared > MAX_FRAME_PAYLOAD {
                self.skip(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).freeze());
        }
    }
}

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(TransportError::PayloadTooLarge(payload.len()));
    }
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[START1, START2]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_to_radio(msg: &ToRadio) -> Result<Vec<u8>, TransportError> {
    let mut payload = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut payload)
        .map_err(|e| TransportError::Encode(e.to_string()))?;
    encode_frame(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_reads() {
        let frame = encode_frame(b"hello").unwrap();
        let mut framer = StreamFramer::new();
        framer.push(&frame[..3]);
        assert!(framer.next_frame().is_none());
        framer.push(&frame[3..]);
        assert_eq!(framer.next_frame().as_deref(), Some(&b"hello"[..]));
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn resyncs_past_log_noise() {
        let mut stream = b"INFO | boot ok\r\n".to_vec();
        stream.extend(encode_frame(b"one").unwrap());
        stream.extend_from_slice(&[0x94, 0x00, 0x94]);
        stream.extend(encode_frame(b"two").unwrap());

        let mut framer = StreamFramer::new();
        framer.push(&stream);
        assert_eq!(framer.next_frame().as_deref(), Some(&b"one"[..]));
        assert_eq!(framer.next_frame().as_deref(), Some(&b"two"[..]));
        assert!(framer.next_frame().is_none());
        assert_eq!(framer.discarded_bytes(), 16 + 3);
    }

    #[test]
    fn oversized_length_is_skipped() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x94, 0xC3, 0xFF, 0xFF]);
        framer.push(&encode_frame(b"ok").unwrap());
        assert_eq!(framer.next_frame().as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn encode_rejects_large_payload() {
        assert!(matches!(
            encode_frame(&[0u8; MAX_FRAME_PAYLOAD + 1]),
            Err(TransportError::PayloadTooLarge(513))
        ));
    }
}
