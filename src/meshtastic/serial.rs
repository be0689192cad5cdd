//! Radio attached over USB/UART serial.
//!
//! `serialport` is blocking, so reads run on a dedicated blocking thread and
//! writes hop onto the blocking pool.
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serialport::{SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::link::{ByteSource, FrameSink, RadioLink};
use crate::bridge::{InboundMessage, Link, Transport, TransportError};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct SerialTransport {
    /// Empty means pick the first USB serial device at open time.
    port: String,
    baud_rate: u32,
    handshake_timeout: Duration,
}

impl SerialTransport {
    pub fn new(port: impl Into<String>, baud_rate: u32, handshake_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            handshake_timeout,
        }
    }

    fn resolve_port(&self) -> Result<String, TransportError> {
        if !self.port.trim().is_empty() {
            return Ok(self.port.clone());
        }
        let detected = detect_serial_ports();
        match detected.into_iter().next() {
            Some(path) => {
                info!("Auto-detected serial device {}", path);
                Ok(path)
            }
            None => Err(TransportError::Unavailable(
                "no USB serial device found; set meshtastic.port".to_string(),
            )),
        }
    }
}

/// Candidate radio devices, USB ports first.
pub fn detect_serial_ports() -> Vec<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Could not enumerate serial ports: {}", e);
            return Vec::new();
        }
    };
    let looks_usb = |name: &str| {
        ["ttyUSB", "ttyACM", "usbserial", "usbmodem", "COM"]
            .iter()
            .any(|hint| name.contains(hint))
    };
    let mut usb: Vec<String> = Vec::new();
    let mut other: Vec<String> = Vec::new();
    for p in ports {
        match p.port_type {
            SerialPortType::UsbPort(_) => usb.push(p.port_name),
            _ if looks_usb(&p.port_name) => other.push(p.port_name),
            _ => {}
        }
    }
    usb.extend(other);
    usb
}

struct SerialSink {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[async_trait]
impl FrameSink for SerialSink {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let port = Arc::clone(&self.port);
        let frame = frame.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "serial port lock poisoned"))?;
            port.write_all(&frame)?;
            port.flush()
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn open_port(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    let mut builder = serialport::new(path, baud_rate).timeout(READ_TIMEOUT);
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| TransportError::Unavailable(format!("{}: {}", path, e)))?;
    // Wake ESP32 boards that gate the UART on DTR/RTS.
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    Ok(port)
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let path = self.resolve_port()?;
        let baud = self.baud_rate;
        debug!("Opening serial port {} at {} baud", path, baud);
        let open_path = path.clone();
        let port = tokio::task::spawn_blocking(move || open_port(&open_path, baud))
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))??;
        let reader = port.try_clone().map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        spawn_reader(path.clone(), reader, chunk_tx, Arc::clone(&stop));

        let source = ByteSource {
            chunks: chunk_rx,
            stop: Box::new(move || stop.store(true, Ordering::SeqCst)),
        };
        let sink = SerialSink {
            port: Arc::new(Mutex::new(port)),
        };
        let link = RadioLink::establish(
            path.clone(),
            source,
            Box::new(sink),
            events,
            self.handshake_timeout,
        )
        .await?;
        info!("Serial radio link up on {}", path);
        Ok(link)
    }

    fn kind(&self) -> &'static str {
        "serial"
    }
}

fn spawn_reader(
    label: String,
    mut port: Box<dyn SerialPort>,
    chunks: mpsc::Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1024];
        while !stop.load(Ordering::SeqCst) {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    trace!("{}: read {} bytes", label, n);
                    if chunks.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("{}: serial read failed: {}", label, e);
                    break;
                }
            }
        }
        debug!("{}: reader stopped", label);
    });
}
