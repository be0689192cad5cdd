//! Connection supervision.
//!
//! The [`ConnectionSupervisor`] is the single owner of the radio session: the
//! current [`ConnectionState`], the live [`Link`] and the reconnect attempt
//! counter all sit behind one lock, and every transition is published on a
//! `watch` channel while that lock is held, so readers never see a state that
//! disagrees with the stored link.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                              |    ^              |
//!                  fail, < max |    | after delay  | loss reported
//!                              v    |              v
//!                          Reconnecting <----------+
//!                              |
//!                  fail == max v
//!                            Failed   (until reset() + connect())
//! ```
//!
//! Every established link gets a new epoch number. Loss reports carry the epoch
//! they were observed on, so a late report about an already replaced link is
//! ignored instead of tearing down the new one.
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::transport::{Link, Transport, TransportError};
use super::types::{ConnectionState, InboundMessage, OutboundReply, RetryPolicy};
use crate::config::MeshtasticConfig;
use crate::metrics::BridgeStats;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Attempts per connect cycle and the pause between them.
    pub reconnect: RetryPolicy,
    /// Pause after a loss before the new cycle starts, so the OS can release the device.
    pub settle_delay: Duration,
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    /// When false a lost link lands in `Disconnected` and stays there.
    pub auto_reconnect: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            reconnect: RetryPolicy::new(3, Duration::from_secs(5)),
            settle_delay: Duration::from_secs(2),
            open_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(5),
            auto_reconnect: true,
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(cfg: &MeshtasticConfig) -> Self {
        Self {
            reconnect: RetryPolicy::new(
                cfg.reconnect_max_attempts,
                Duration::from_secs(cfg.reconnect_delay_secs),
            ),
            settle_delay: Duration::from_secs(cfg.settle_delay_secs),
            open_timeout: Duration::from_secs(cfg.open_timeout_secs),
            close_timeout: Duration::from_secs(cfg.close_timeout_secs),
            auto_reconnect: cfg.auto_reconnect,
        }
    }
}

/// A live link tagged with the epoch it was established in.
#[derive(Clone)]
pub struct LinkHandle {
    epoch: u64,
    link: Arc<dyn Link>,
}

impl LinkHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub fn describe(&self) -> String {
        self.link.describe()
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("epoch", &self.epoch)
            .field("link", &self.link.describe())
            .finish()
    }
}

/// Result of a connect cycle. Failures are values, not errors.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(LinkHandle),
    /// Attempts exhausted; the supervisor now reports `Failed`.
    Failed { attempts: u32, last_error: String },
    /// Another cycle is already running.
    InProgress,
    /// `disconnect()` was requested while the cycle was running.
    Cancelled,
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected(_))
    }
}

struct Inner {
    state: ConnectionState,
    link: Option<LinkHandle>,
    epoch: u64,
    attempts: u32,
    last_error: Option<String>,
    cancel: CancellationToken,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    settings: SupervisorSettings,
    events: mpsc::UnboundedSender<InboundMessage>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    cycle: tokio::sync::Mutex<()>,
    stats: Arc<BridgeStats>,
}

impl ConnectionSupervisor {
    /// Create the supervisor and the inbound event stream every link will feed.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: SupervisorSettings,
        stats: Arc<BridgeStats>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (events, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let supervisor = Arc::new(Self {
            transport,
            settings,
            events,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                link: None,
                epoch: 0,
                attempts: 0,
                last_error: None,
                cancel: CancellationToken::new(),
            }),
            state_tx,
            cycle: tokio::sync::Mutex::new(()),
            stats,
        });
        (supervisor, inbound_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state != next {
            debug!("connection state {} -> {}", inner.state, next);
        }
        inner.state = next;
        self.state_tx.send_replace(next);
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Failed attempts in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Error of the most recent failed attempt, kept for diagnostics.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// The current link, only while `Connected`.
    pub fn live_link(&self) -> Option<LinkHandle> {
        let inner = self.lock();
        if inner.state.is_connected() {
            inner.link.clone()
        } else {
            None
        }
    }

    /// Run a connect cycle: up to `max_attempts` opens with a pause between them.
    ///
    /// Returns immediately with the existing handle when already connected and
    /// with `Failed` when the supervisor is in the terminal state.
    pub async fn connect(self: &Arc<Self>) -> ConnectOutcome {
        let token = self.lock().cancel.clone();
        self.connect_cycle(token).await
    }

    /// Run a connect cycle in the background.
    ///
    /// The cycle is bound to the current cancellation scope, so a `disconnect()`
    /// issued before the task is first polled still cancels it.
    pub fn spawn_connect(self: &Arc<Self>) -> JoinHandle<ConnectOutcome> {
        let token = self.lock().cancel.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.connect_cycle(token).await })
    }

    /// Leave `Failed`: clear the attempt counter and return to `Disconnected`.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.attempts = 0;
        if inner.state == ConnectionState::Failed {
            info!("Connection supervisor reset after failure");
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
    }

    async fn connect_cycle(self: &Arc<Self>, token: CancellationToken) -> ConnectOutcome {
        let _cycle = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("connect requested while a cycle is already running");
                return ConnectOutcome::InProgress;
            }
        };

        {
            let inner = self.lock();
            match inner.state {
                ConnectionState::Connected => {
                    if let Some(handle) = inner.link.clone() {
                        return ConnectOutcome::Connected(handle);
                    }
                }
                ConnectionState::Failed => {
                    return ConnectOutcome::Failed {
                        attempts: inner.attempts,
                        last_error: inner.last_error.clone().unwrap_or_default(),
                    };
                }
                _ => {}
            }
        }

        let kind = self.transport.kind();
        let policy = self.settings.reconnect;
        loop {
            let attempt = {
                let mut inner = self.lock();
                if token.is_cancelled() {
                    return ConnectOutcome::Cancelled;
                }
                self.set_state(&mut inner, ConnectionState::Connecting);
                inner.attempts + 1
            };
            info!(
                "Opening {} radio link (attempt {}/{})",
                kind, attempt, policy.max_attempts
            );

            let open_timeout = self.settings.open_timeout;
            let result = tokio::select! {
                _ = token.cancelled() => return ConnectOutcome::Cancelled,
                r = tokio::time::timeout(open_timeout, self.transport.open(self.events.clone())) => match r {
                    Ok(r) => r,
                    Err(_) => Err(TransportError::Timeout(open_timeout.as_secs())),
                },
            };

            match result {
                Ok(link) => {
                    let accepted = {
                        let mut inner = self.lock();
                        if token.is_cancelled() {
                            None
                        } else {
                            inner.epoch += 1;
                            inner.attempts = 0;
                            inner.last_error = None;
                            let handle = LinkHandle {
                                epoch: inner.epoch,
                                link: Arc::clone(&link),
                            };
                            inner.link = Some(handle.clone());
                            self.set_state(&mut inner, ConnectionState::Connected);
                            Some(handle)
                        }
                    };
                    return match accepted {
                        Some(handle) => {
                            info!("Connected via {} ({})", kind.to_uppercase(), handle.describe());
                            ConnectOutcome::Connected(handle)
                        }
                        None => {
                            debug!("link opened after disconnect was requested; closing it");
                            self.close_quietly(link).await;
                            ConnectOutcome::Cancelled
                        }
                    };
                }
                Err(e) => {
                    let (attempts, exhausted) = {
                        let mut inner = self.lock();
                        if token.is_cancelled() {
                            return ConnectOutcome::Cancelled;
                        }
                        inner.attempts += 1;
                        inner.last_error = Some(e.to_string());
                        let exhausted = !policy.allows_retry(inner.attempts);
                        let next = if exhausted {
                            ConnectionState::Failed
                        } else {
                            ConnectionState::Reconnecting
                        };
                        self.set_state(&mut inner, next);
                        (inner.attempts, exhausted)
                    };
                    if exhausted {
                        error!("radio link failed after {} attempts: {}", attempts, e);
                        return ConnectOutcome::Failed {
                            attempts,
                            last_error: e.to_string(),
                        };
                    }
                    warn!(
                        "Connect attempt {}/{} failed: {}. Retrying in {}s...",
                        attempts,
                        policy.max_attempts,
                        e,
                        policy.delay_between_attempts.as_secs()
                    );
                    tokio::select! {
                        _ = token.cancelled() => return ConnectOutcome::Cancelled,
                        _ = tokio::time::sleep(policy.delay_between_attempts) => {}
                    }
                }
            }
        }
    }

    /// Close the link and land in `Disconnected`. Idempotent; close errors are logged only.
    ///
    /// Also cancels any running connect cycle or scheduled reconnect.
    pub async fn disconnect(&self) {
        let stale = {
            let mut inner = self.lock();
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            inner.attempts = 0;
            let link = inner.link.take();
            self.set_state(&mut inner, ConnectionState::Disconnected);
            link
        };
        match stale {
            Some(handle) => {
                info!("Disconnecting from {}", handle.describe());
                self.close_quietly(handle.link).await;
            }
            None => debug!("disconnect: no live link"),
        }
    }

    /// Report that the link of `epoch` is gone.
    ///
    /// Returns true when this call started recovery. Reports for an epoch that
    /// is no longer live (duplicates, late send failures) return false.
    pub fn on_connection_lost(self: &Arc<Self>, epoch: u64) -> bool {
        let auto = self.settings.auto_reconnect;
        let (lost, token) = {
            let mut inner = self.lock();
            let current = match &inner.link {
                Some(h) if h.epoch == epoch && inner.state.is_connected() => h.clone(),
                _ => {
                    debug!("ignoring loss report for stale link epoch {}", epoch);
                    return false;
                }
            };
            inner.link = None;
            let next = if auto {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            self.set_state(&mut inner, next);
            (current, inner.cancel.clone())
        };

        if auto {
            self.stats.inc_reconnect_cycles();
            warn!(
                "Connection lost on {} - reconnecting in {}s",
                lost.describe(),
                self.settings.settle_delay.as_secs()
            );
        } else {
            warn!("Connection lost on {} (auto-reconnect disabled)", lost.describe());
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.close_quietly(lost.link).await;
            if !auto {
                return;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("scheduled reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(this.settings.settle_delay) => {}
            }
            match this.connect_cycle(token).await {
                ConnectOutcome::Connected(handle) => info!("Reconnected ({})", handle.describe()),
                ConnectOutcome::Failed { attempts, last_error } => {
                    error!("Reconnect gave up after {} attempts: {}", attempts, last_error)
                }
                ConnectOutcome::InProgress => debug!("reconnect skipped: cycle already running"),
                ConnectOutcome::Cancelled => debug!("reconnect cancelled"),
            }
        });
        true
    }

    /// Single send attempt over the live link.
    ///
    /// Refuses to send unless `Connected`. A send error that means the link is
    /// gone is also reported as a loss for that link's epoch.
    pub async fn send(self: &Arc<Self>, reply: &OutboundReply) -> Result<(), TransportError> {
        let handle = self.live_link().ok_or(TransportError::NotConnected)?;
        match handle.link.send(reply).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_link_loss() {
                    self.on_connection_lost(handle.epoch);
                }
                Err(e)
            }
        }
    }

    async fn close_quietly(&self, link: Arc<dyn Link>) {
        let label = link.describe();
        match tokio::time::timeout(self.settings.close_timeout, link.close()).await {
            Ok(Ok(())) => debug!("closed {}", label),
            Ok(Err(e)) => warn!("Error while closing {} (ignored): {}", label, e),
            Err(_) => warn!(
                "Closing {} timed out after {}s (ignored)",
                label,
                self.settings.close_timeout.as_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let mut cfg = MeshtasticConfig::default();
        cfg.probe_timeout_secs = 1;
        cfg.close_timeout_secs = 7;
        cfg.reconnect_max_attempts = 4;
        let settings = SupervisorSettings::from_config(&cfg);
        assert_eq!(settings.close_timeout, Duration::from_secs(7));
        assert_eq!(settings.open_timeout, Duration::from_secs(15));
        assert_eq!(settings.reconnect.max_attempts, 4);
        assert!(settings.auto_reconnect);
    }
}
