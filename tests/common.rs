//! Test doubles shared by the integration tests.
//!
//! `ScriptedTransport` stands in for a radio: opens can be made to fail,
//! links can be broken on demand, probes can hang, sent replies are recorded and inbound text
//! can be injected. `ScriptedBackend` stands in for the model.
#![allow(dead_code)]

use async_trait::async_trait;
use meshai::bridge::{
    Backend, BackendError, ConnectionState, ConnectionSupervisor, InboundMessage, Link, OutboundReply,
    RetryPolicy, SupervisorSettings, Transport, TransportError,
};
use meshai::metrics::BridgeStats;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    opens: AtomicU32,
    closes: AtomicU32,
    probes: AtomicU32,
    send_attempts: AtomicU32,
    /// Remaining opens that fail; u32::MAX fails forever.
    failing_opens: AtomicU32,
    /// Links with an id at or below this are dead.
    broken_up_to: AtomicU32,
    fail_sends: AtomicBool,
    hang_probes: AtomicBool,
    open_delay_ms: AtomicU32,
    sent: Mutex<Vec<OutboundReply>>,
    events: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn as_transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::clone(self) as Arc<dyn Transport>
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.shared.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn always_fail(&self) {
        self.fail_next_opens(u32::MAX);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.shared
            .open_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// Kill every link opened so far; probes and sends on them fail from now on.
    pub fn break_current_link(&self) {
        let current = self.shared.opens.load(Ordering::SeqCst);
        self.shared.broken_up_to.store(current, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Probes never answer while set.
    pub fn hang_probes(&self, hang: bool) {
        self.shared.hang_probes.store(hang, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u32 {
        self.shared.probes.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> u32 {
        self.shared.send_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundReply> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// Push a text event into the bridge as if it came off the mesh.
    pub fn inject(&self, sender: &str, channel: u32, text: &str) -> bool {
        match self.shared.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(InboundMessage::new(sender, channel, text)).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let id = self.shared.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.shared.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let remaining = self.shared.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.shared.failing_opens.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(TransportError::Unavailable(format!("scripted open failure #{}", id)));
        }
        *self.shared.events.lock().unwrap() = Some(events);
        Ok(Arc::new(ScriptedLink {
            id,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedLink {
    id: u32,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl ScriptedLink {
    fn alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.id > self.shared.broken_up_to.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for ScriptedLink {
    async fn send(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        self.shared.send_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.alive() {
            return Err(TransportError::Closed);
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)));
        }
        self.shared.sent.lock().unwrap().push(reply.clone());
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.shared.probes.fetch_add(1, Ordering::SeqCst);
        if self.shared.hang_probes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.alive() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("scripted link #{}", self.id)
    }
}

/// Model stand-in: fails the first `failures` calls, then answers.
pub struct ScriptedBackend {
    answer: String,
    failures: u32,
    error: BackendError,
    delay: Duration,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            failures: 0,
            error: BackendError::Connect("refused".into()),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_first(mut self, failures: u32, error: BackendError) -> Self {
        self.failures = failures;
        self.error = error;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n <= self.failures {
            Err(self.error.clone())
        } else {
            Ok(self.answer.clone())
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn endpoint(&self) -> &str {
        "scripted://backend"
    }
}

/// Millisecond-scale supervisor timings.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        reconnect: RetryPolicy::new(3, Duration::from_millis(10)),
        settle_delay: Duration::from_millis(10),
        open_timeout: Duration::from_secs(1),
        close_timeout: Duration::from_millis(200),
        auto_reconnect: true,
    }
}

pub fn supervisor_with(
    transport: &Arc<ScriptedTransport>,
    settings: SupervisorSettings,
) -> (
    Arc<ConnectionSupervisor>,
    mpsc::UnboundedReceiver<InboundMessage>,
    Arc<BridgeStats>,
) {
    let stats = Arc::new(BridgeStats::new());
    let (supervisor, rx) = ConnectionSupervisor::new(transport.as_transport(), settings, Arc::clone(&stats));
    (supervisor, rx, stats)
}

/// Poll until `cond` holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub async fn wait_for_state(supervisor: &ConnectionSupervisor, state: ConnectionState, timeout: Duration) -> bool {
    let mut rx = supervisor.subscribe_state();
    tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}
