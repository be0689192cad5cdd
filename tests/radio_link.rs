//! A radio session abandoned mid-handshake must not keep feeding the bridge.
mod common;

use async_trait::async_trait;
use common::fast_settings;
use meshai::bridge::{
    ConnectOutcome, ConnectionState, ConnectionSupervisor, InboundMessage, Link, RetryPolicy, Transport,
    TransportError,
};
use meshai::meshtastic::framing::encode_frame;
use meshai::meshtastic::link::{ByteSource, FrameSink, RadioLink};
use meshai::meshtastic::proto::{self, from_radio, mesh_packet, FromRadio, PortNum};
use meshai::metrics::BridgeStats;
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct NullSink;

#[async_trait]
impl FrameSink for NullSink {
    async fn write_frame(&mut self, _frame: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
    async fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Takes a while to open the device, then never answers the handshake.
#[derive(Default)]
struct SilentRadio {
    device_open: Duration,
    handshake: Duration,
    stopped: Arc<AtomicBool>,
    feed: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

#[async_trait]
impl Transport for SilentRadio {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        tokio::time::sleep(self.device_open).await;
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        *self.feed.lock().unwrap() = Some(chunk_tx);
        let stopped = Arc::clone(&self.stopped);
        let source = ByteSource {
            chunks: chunk_rx,
            stop: Box::new(move || stopped.store(true, Ordering::SeqCst)),
        };
        let link = RadioLink::establish("silent", source, Box::new(NullSink), events, self.handshake).await?;
        Ok(link)
    }

    fn kind(&self) -> &'static str {
        "silent"
    }
}

fn text_frame(text: &str) -> Vec<u8> {
    let msg = FromRadio {
        id: 1,
        payload_variant: Some(from_radio::PayloadVariant::Packet(proto::MeshPacket {
            from: 0xabc123,
            to: meshai::meshtastic::BROADCAST_ADDR,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        })),
    };
    encode_frame(&msg.encode_to_vec()).unwrap()
}

#[tokio::test]
async fn open_timeout_during_handshake_releases_the_reader() {
    let radio = Arc::new(SilentRadio {
        device_open: Duration::from_millis(50),
        handshake: Duration::from_millis(200),
        ..Default::default()
    });
    let mut settings = fast_settings();
    settings.reconnect = RetryPolicy::new(1, Duration::from_millis(10));
    settings.open_timeout = Duration::from_millis(200);
    let (supervisor, mut inbound) = ConnectionSupervisor::new(
        Arc::clone(&radio) as Arc<dyn Transport>,
        settings,
        Arc::new(BridgeStats::new()),
    );

    assert!(matches!(supervisor.connect().await, ConnectOutcome::Failed { .. }));
    assert_eq!(supervisor.current_state(), ConnectionState::Failed);
    assert!(radio.stopped.load(Ordering::SeqCst));

    let feed = radio.feed.lock().unwrap().clone().expect("device was opened");
    let _ = feed.send(text_frame("/AI still there?")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(feed.is_closed());
    assert!(inbound.try_recv().is_err());
}
