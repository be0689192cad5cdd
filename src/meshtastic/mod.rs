//! # Meshtastic Device Communication Module
//!
//! Transports that open a session to a Meshtastic radio and expose it as a
//! [`crate::bridge::Link`]:
//!
//! - [`serial::SerialTransport`] - USB/UART, optional `serial` feature
//! - [`tcp::TcpTransport`] - network-attached radios (port 4403)
//! - [`console::ConsoleTransport`] - stdin/stdout, no hardware needed
//!
//! Serial and TCP speak the protobuf stream API ([`framing`], [`proto`]) through
//! a shared [`link::RadioLink`].
//!
//! ```toml
//! [meshtastic]
//! connection_type = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! ```
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::Transport;
use crate::config::{ConnectionType, MeshtasticConfig};

pub mod console;
pub mod framing;
pub mod link;
pub mod proto;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

/// Destination address for channel-wide packets.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Canonical `!xxxxxxxx` form of a node number.
pub fn node_id_string(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse `!a1b2c3d4`, `0xa1b2c3d4` or a decimal node number.
pub fn parse_node_id(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('!').or_else(|| s.strip_prefix("0x")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Time a radio gets to answer `want_config_id`: three quarters of the open
/// timeout, so the link's own failure path runs before the supervisor gives up.
pub fn handshake_timeout(open_timeout: Duration) -> Duration {
    open_timeout * 3 / 4
}

/// Build the transport selected by `[meshtastic]`.
pub fn transport_from_config(cfg: &MeshtasticConfig) -> Result<Arc<dyn Transport>> {
    let handshake_timeout = handshake_timeout(Duration::from_secs(cfg.open_timeout_secs));
    match cfg.connection_type {
        ConnectionType::Tcp => {
            if cfg.tcp_host.trim().is_empty() {
                return Err(anyhow!("TCP connection selected but meshtastic.tcp_host is empty"));
            }
            Ok(Arc::new(tcp::TcpTransport::new(&cfg.tcp_host, handshake_timeout)))
        }
        ConnectionType::Console => Ok(Arc::new(console::ConsoleTransport::new())),
        #[cfg(feature = "serial")]
        ConnectionType::Serial => Ok(Arc::new(serial::SerialTransport::new(
            cfg.port.clone(),
            cfg.baud_rate,
            handshake_timeout,
        ))),
        #[cfg(not(feature = "serial"))]
        ConnectionType::Serial => Err(anyhow!(
            "serial support not compiled in; rebuild with --features serial or use tcp"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_format_and_parse() {
        assert_eq!(node_id_string(0xabc123), "!00abc123");
        assert_eq!(parse_node_id("!00abc123"), Some(0xabc123));
        assert_eq!(parse_node_id("0xdeadbeef"), Some(0xdeadbeef));
        assert_eq!(parse_node_id("42"), Some(42));
        assert_eq!(parse_node_id("!zz"), None);
    }

    #[test]
    fn handshake_fits_inside_open_timeout() {
        assert_eq!(handshake_timeout(Duration::from_secs(15)), Duration::from_millis(11_250));
        assert!(handshake_timeout(Duration::from_secs(1)) < Duration::from_secs(1));
    }

    #[test]
    fn tcp_without_host_is_rejected() {
        let cfg = MeshtasticConfig {
            connection_type: ConnectionType::Tcp,
            ..Default::default()
        };
        assert!(transport_from_config(&cfg).is_err());
        let cfg = MeshtasticConfig {
            connection_type: ConnectionType::Tcp,
            tcp_host: "10.1.1.1".into(),
            ..Default::default()
        };
        assert_eq!(transport_from_config(&cfg).unwrap().kind(), "tcp");
    }
}
