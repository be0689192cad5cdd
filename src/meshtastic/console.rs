//! Terminal stand-in for a radio, for trying the bridge without hardware.
//!
//! Each stdin line becomes a text event from `!local` on channel 0; replies are
//! printed to stdout.
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{InboundMessage, Link, OutboundReply, Transport, TransportError};

pub const CONSOLE_SENDER: &str = "!local";

#[derive(Debug, Default)]
pub struct ConsoleTransport;

impl ConsoleTransport {
    pub fn new() -> Self {
        Self
    }
}

struct ConsoleLink {
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if events.send(InboundMessage::new(CONSOLE_SENDER, 0, line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("console input closed");
                        break;
                    }
                    Err(e) => {
                        debug!("console read error: {}", e);
                        break;
                    }
                }
            }
        });
        println!("meshai console ready. Type '/AI <question>' and press Enter.");
        Ok(Arc::new(ConsoleLink {
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        }))
    }

    fn kind(&self) -> &'static str {
        "console"
    }
}

#[async_trait]
impl Link for ConsoleLink {
    async fn send(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        println!("[ch {}] {}", reply.channel_index, reply.text());
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "console".to_string()
    }
}
