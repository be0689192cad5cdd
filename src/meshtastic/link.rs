//! A live protobuf session with a Meshtastic radio, independent of the byte carrier.
//!
//! Serial and TCP transports both hand a [`ByteSource`] and a [`FrameSink`] to
//! [`RadioLink::establish`], which runs the `want_config_id` handshake and then
//! keeps a reader task turning `FromRadio` frames into [`InboundMessage`]s.
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use prost::Message;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::framing::{encode_to_radio, StreamFramer};
use super::proto::{self, from_radio, mesh_packet, to_radio, FromRadio, PortNum, ToRadio};
use super::{node_id_string, BROADCAST_ADDR};
use crate::bridge::{InboundMessage, Link, OutboundReply, TransportError};
use crate::logutil::preview;

/// Hop limit for replies; firmware default.
pub const REPLY_HOP_LIMIT: u32 = 3;
/// Largest text payload the firmware accepts in one packet.
pub const MAX_TEXT_PAYLOAD: usize = 233;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of a radio connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Read half of a radio connection: raw chunks plus a way to stop the pump feeding them.
pub struct ByteSource {
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub stop: Box<dyn FnOnce() + Send>,
}

/// Owns the byte pump's stop hook and the reader task; releases both on drop,
/// so a handshake abandoned by its caller leaves nothing running.
struct ReaderGuard {
    stop: Option<Box<dyn FnOnce() + Send>>,
    reader: Option<JoinHandle<()>>,
}

impl ReaderGuard {
    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct RadioLink {
    label: String,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    node_num: u32,
    reader_alive: Arc<AtomicBool>,
    closed: AtomicBool,
    reader: Mutex<ReaderGuard>,
}

impl RadioLink {
    /// Request the radio's config and wait for its node number.
    ///
    /// Fails with `Handshake` when the radio never identifies itself within
    /// `handshake_timeout`, which usually means it is not in protobuf API mode.
    /// Dropping the returned future stops the byte source and the reader.
    pub async fn establish(
        label: impl Into<String>,
        source: ByteSource,
        sink: Box<dyn FrameSink>,
        events: mpsc::UnboundedSender<InboundMessage>,
        handshake_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let label = label.into();
        let ByteSource { chunks, stop } = source;
        let (node_tx, mut node_rx) = watch::channel(0u32);
        let reader_alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            label.clone(),
            chunks,
            node_tx,
            events,
            Arc::clone(&reader_alive),
        ));

        let link = RadioLink {
            label,
            sink: tokio::sync::Mutex::new(sink),
            node_num: 0,
            reader_alive,
            closed: AtomicBool::new(false),
            reader: Mutex::new(ReaderGuard {
                stop: Some(stop),
                reader: Some(reader),
            }),
        };

        let config_id = nonzero_random();
        debug!("{}: requesting config (want_config_id=0x{:08x})", link.label, config_id);
        let handshake = async {
            link.write_to_radio(ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::WantConfigId(config_id)),
            })
            .await?;
            node_rx
                .wait_for(|n| *n != 0)
                .await
                .map(|n| *n)
                .map_err(|_| TransportError::Handshake("radio closed the stream".to_string()))
        };
        let node_num = match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                link.teardown().await;
                return Err(e);
            }
            Err(_) => {
                link.teardown().await;
                return Err(TransportError::Handshake(format!(
                    "no node info within {}s; is the device in protobuf API mode?",
                    handshake_timeout.as_secs()
                )));
            }
        };

        info!("{}: radio identified as {}", link.label, node_id_string(node_num));
        Ok(Arc::new(RadioLink { node_num, ..link }))
    }

    pub fn node_num(&self) -> u32 {
        self.node_num
    }

    async fn write_to_radio(&self, msg: ToRadio) -> Result<(), TransportError> {
        let frame = encode_to_radio(&msg)?;
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, sink.write_frame(&frame)).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout(WRITE_TIMEOUT.as_secs())),
        }
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || !self.reader_alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn teardown(&self) {
        if let Ok(mut guard) = self.reader.lock() {
            guard.release();
        }
        if let Err(e) = self.sink.lock().await.shutdown().await {
            debug!("{}: shutdown error: {}", self.label, e);
        }
    }
}

#[async_trait]
impl Link for RadioLink {
    async fn send(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let payload = reply.payload_bytes();
        if payload.len() > MAX_TEXT_PAYLOAD {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let packet = proto::MeshPacket {
            from: self.node_num,
            to: BROADCAST_ADDR,
            channel: reply.channel_index,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: payload.to_vec(),
                ..Default::default()
            })),
            id: nonzero_random(),
            hop_limit: REPLY_HOP_LIMIT,
            ..Default::default()
        };
        let id = packet.id;
        self.write_to_radio(ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        })
        .await?;
        debug!(
            "{}: sent text packet id=0x{:08x} ch={} ({} bytes)",
            self.label,
            id,
            reply.channel_index,
            payload.len()
        );
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let nonce = rand::thread_rng().gen::<u32>();
        self.write_to_radio(ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(proto::Heartbeat { nonce })),
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.reader_alive.load(Ordering::SeqCst) {
            let bye = ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
            };
            if let Err(e) = self.write_to_radio(bye).await {
                debug!("{}: disconnect notice not delivered: {}", self.label, e);
            }
        }
        self.teardown().await;
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

fn nonzero_random() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

async fn read_loop(
    label: String,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    node_tx: watch::Sender<u32>,
    events: mpsc::UnboundedSender<InboundMessage>,
    alive: Arc<AtomicBool>,
) {
    let mut framer = StreamFramer::new();
    while let Some(chunk) = chunks.recv().await {
        framer.push(&chunk);
        while let Some(frame) = framer.next_frame() {
            match FromRadio::decode(frame) {
                Ok(msg) => handle_from_radio(&label, msg, &node_tx, &events),
                Err(e) => trace!("{}: undecodable frame: {}", label, e),
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    warn!("{}: radio stream ended", label);
}

fn handle_from_radio(
    label: &str,
    msg: FromRadio,
    node_tx: &watch::Sender<u32>,
    events: &mpsc::UnboundedSender<InboundMessage>,
) {
    match msg.payload_variant {
        Some(from_radio::PayloadVariant::MyInfo(info)) => {
            debug!("{}: my_info node={}", label, node_id_string(info.my_node_num));
            node_tx.send_replace(info.my_node_num);
        }
        Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
            debug!("{}: config complete (id=0x{:08x})", label, id);
        }
        Some(from_radio::PayloadVariant::Rebooted(_)) => {
            warn!("{}: radio reported a reboot", label);
        }
        Some(from_radio::PayloadVariant::Packet(pkt)) => {
            if let Some(inbound) = decode_text_packet(&pkt, *node_tx.borrow()) {
                trace!(
                    "{}: text from {} ch {}: {}",
                    label,
                    inbound.sender_id,
                    inbound.channel_index,
                    preview(&inbound.text, 80)
                );
                let _ = events.send(inbound);
            }
        }
        None => {}
    }
}

/// Text event for a decoded `TEXT_MESSAGE_APP` packet not sent by `own_node`.
pub fn decode_text_packet(pkt: &proto::MeshPacket, own_node: u32) -> Option<InboundMessage> {
    let data = match &pkt.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(data)) => data,
        _ => return None,
    };
    if PortNum::try_from(data.portnum).ok()? != PortNum::TextMessageApp {
        return None;
    }
    if own_node != 0 && pkt.from == own_node {
        return None;
    }
    let text = String::from_utf8_lossy(&data.payload).into_owned();
    Some(InboundMessage::new(node_id_string(pkt.from), pkt.channel, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::framing::{encode_frame, StreamFramer};

    /// In-memory radio: frames written by the link land in `written`.
    struct MemorySink {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.written.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
        async fn shutdown(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn from_radio_frame(variant: from_radio::PayloadVariant) -> Vec<u8> {
        let msg = FromRadio {
            id: 1,
            payload_variant: Some(variant),
        };
        encode_frame(&msg.encode_to_vec()).unwrap()
    }

    fn text_packet(from: u32, channel: u32, text: &str) -> proto::MeshPacket {
        proto::MeshPacket {
            from,
            to: BROADCAST_ADDR,
            channel,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn decode_written(frame: &[u8]) -> ToRadio {
        let mut framer = StreamFramer::new();
        framer.push(frame);
        ToRadio::decode(framer.next_frame().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn handshake_then_text_events_and_broadcast_reply() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let source = ByteSource {
            chunks: chunk_rx,
            stop: Box::new(|| {}),
        };
        let sink = Box::new(MemorySink {
            written: Arc::clone(&written),
        });

        chunk_tx
            .send(from_radio_frame(from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo {
                my_node_num: 0x0102_0304,
            })))
            .await
            .unwrap();
        let link = RadioLink::establish("mem", source, sink, events_tx, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(link.node_num(), 0x0102_0304);

        chunk_tx
            .send(from_radio_frame(from_radio::PayloadVariant::Packet(text_packet(
                0xabc123, 2, "/AI hello",
            ))))
            .await
            .unwrap();
        let inbound = events_rx.recv().await.unwrap();
        assert_eq!(inbound.sender_id, "!00abc123");
        assert_eq!(inbound.channel_index, 2);
        assert_eq!(inbound.text, "/AI hello");

        let reply = crate::bridge::ReplyEncoder::default().reply_to(&inbound, "hi");
        link.send(&reply).await.unwrap();

        let frames = written.lock().unwrap().clone();
        assert!(matches!(
            decode_written(&frames[0]).payload_variant,
            Some(to_radio::PayloadVariant::WantConfigId(id)) if id != 0
        ));
        match decode_written(&frames[1]).payload_variant {
            Some(to_radio::PayloadVariant::Packet(pkt)) => {
                assert_eq!(pkt.to, BROADCAST_ADDR);
                assert_eq!(pkt.from, 0x0102_0304);
                assert_eq!(pkt.channel, 2);
                assert_eq!(pkt.hop_limit, REPLY_HOP_LIMIT);
                assert_ne!(pkt.id, 0);
            }
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn handshake_fails_when_stream_closes() {
        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        drop(chunk_tx);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let source = ByteSource {
            chunks: chunk_rx,
            stop: Box::new(|| {}),
        };
        let sink = Box::new(MemorySink {
            written: Arc::new(Mutex::new(Vec::new())),
        });
        let result = RadioLink::establish("mem", source, sink, events_tx, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn abandoned_handshake_stops_source_and_reader() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stopped);
        let source = ByteSource {
            chunks: chunk_rx,
            stop: Box::new(move || stop_flag.store(true, Ordering::SeqCst)),
        };
        let sink = Box::new(MemorySink {
            written: Arc::new(Mutex::new(Vec::new())),
        });

        let establish = RadioLink::establish("mem", source, sink, events_tx, Duration::from_secs(10));
        assert!(tokio::time::timeout(Duration::from_millis(50), establish).await.is_err());
        assert!(stopped.load(Ordering::SeqCst));

        // Late traffic from the radio must not reach the bridge.
        let _ = chunk_tx
            .send(from_radio_frame(from_radio::PayloadVariant::Packet(text_packet(
                0xabc123, 0, "/AI late",
            ))))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events_rx.try_recv().is_err());
        assert!(chunk_tx.is_closed());
    }

    #[test]
    fn own_and_non_text_packets_are_skipped() {
        assert!(decode_text_packet(&text_packet(7, 0, "echo"), 7).is_none());
        let mut pkt = text_packet(8, 0, "pos");
        if let Some(mesh_packet::PayloadVariant::Decoded(d)) = pkt.payload_variant.as_mut() {
            d.portnum = PortNum::PositionApp as i32;
        }
        assert!(decode_text_packet(&pkt, 7).is_none());
        assert!(decode_text_packet(&text_packet(8, 1, "hi"), 7).is_some());
    }
}
