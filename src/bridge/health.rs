//! Periodic link probing.
//!
//! A single background task probes the live link while the supervisor is
//! `Connected`. The first failed or timed-out probe is reported as a loss for
//! that link's epoch, after which the monitor suspends until the supervisor is
//! connected again. Probing never overlaps a connect cycle.
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::supervisor::ConnectionSupervisor;
use crate::config::MeshtasticConfig;
use crate::metrics::BridgeStats;

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthSettings {
    pub fn from_config(cfg: &MeshtasticConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.health_check_interval_secs),
            probe_timeout: Duration::from_secs(cfg.probe_timeout_secs),
        }
    }
}

/// Handle to the running monitor task.
pub struct HealthMonitor {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(
        supervisor: Arc<ConnectionSupervisor>,
        settings: HealthSettings,
        stats: Arc<BridgeStats>,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(supervisor, settings, stats, stop.clone()));
        Self { stop, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!("health monitor task ended abnormally: {}", e);
        }
    }
}

async fn run(
    supervisor: Arc<ConnectionSupervisor>,
    settings: HealthSettings,
    stats: Arc<BridgeStats>,
    stop: CancellationToken,
) {
    let mut state_rx = supervisor.subscribe_state();
    loop {
        // Suspended until the supervisor reports a live link.
        tokio::select! {
            _ = stop.cancelled() => return,
            r = state_rx.wait_for(|s| s.is_connected()) => {
                if r.is_err() {
                    return;
                }
            }
        }
        let Some(handle) = supervisor.live_link() else {
            tokio::task::yield_now().await;
            continue;
        };
        debug!("health monitor watching link epoch {}", handle.epoch());

        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Any transition invalidates the handle; re-evaluate.
                    break;
                }
                _ = ticker.tick() => {}
            }

            let verdict = match tokio::time::timeout(settings.probe_timeout, handle.link().probe()).await {
                Ok(Ok(())) => {
                    trace!("probe ok on {}", handle.describe());
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no answer within {}s", settings.probe_timeout.as_secs()),
            };
            stats.inc_probe_failures();
            warn!("Health check failed on {}: {}", handle.describe(), verdict);
            if !supervisor.on_connection_lost(handle.epoch()) {
                debug!("link epoch {} already replaced", handle.epoch());
            }
            break;
        }
    }
}
