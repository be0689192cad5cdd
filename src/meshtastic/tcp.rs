//! Radio reached over the network (firmware TCP API, default port 4403).
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::link::{ByteSource, FrameSink, RadioLink};
use crate::bridge::{InboundMessage, Link, Transport, TransportError};

pub const DEFAULT_TCP_PORT: u16 = 4403;

pub struct TcpTransport {
    host: String,
    port: u16,
    handshake_timeout: Duration,
}

impl TcpTransport {
    /// `addr` is `host` or `host:port`.
    pub fn new(addr: &str, handshake_timeout: Duration) -> Self {
        let (host, port) = split_host_port(addr);
        Self {
            host,
            port,
            handshake_timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split `host[:port]`, falling back to the default API port.
pub fn split_host_port(addr: &str) -> (String, u16) {
    let addr = addr.trim();
    if let Some((host, port)) = addr.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }
    (addr.to_string(), DEFAULT_TCP_PORT)
}

struct TcpSink(OwnedWriteHalf);

#[async_trait]
impl FrameSink for TcpSink {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.0.write_all(frame).await?;
        self.0.flush().await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.0.shutdown().await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let addr = self.address();
        debug!("Connecting to radio at {}", addr);
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let pump_label = addr.clone();
        let pump = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!("{}: peer closed connection", pump_label);
                        break;
                    }
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("{}: read error: {}", pump_label, e);
                        break;
                    }
                }
            }
        });

        let source = ByteSource {
            chunks: chunk_rx,
            stop: Box::new(move || pump.abort()),
        };
        let link = RadioLink::establish(
            format!("tcp://{}", addr),
            source,
            Box::new(TcpSink(write_half)),
            events,
            self.handshake_timeout,
        )
        .await?;
        info!("TCP radio link up at {}", addr);
        Ok(link)
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(split_host_port("10.0.0.5"), ("10.0.0.5".to_string(), 4403));
        assert_eq!(split_host_port("meshnode.local:4500"), ("meshnode.local".to_string(), 4500));
        assert_eq!(split_host_port(" radio:abc "), ("radio:abc".to_string(), 4403));
    }
}
