//! Bridge run loop: wires supervisor, monitor and router together and owns shutdown.
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::health::{HealthMonitor, HealthSettings};
use super::query::QueryClient;
use super::router::MessageRouter;
use super::supervisor::{ConnectOutcome, ConnectionSupervisor, SupervisorSettings};
use super::transport::Transport;
use super::types::{ConnectionState, InboundMessage};
use crate::config::Config;
use crate::metrics::BridgeStats;

pub struct BridgeServer {
    config: Config,
    supervisor: Arc<ConnectionSupervisor>,
    router: MessageRouter,
    inbound_rx: Option<mpsc::UnboundedReceiver<InboundMessage>>,
    stats: Arc<BridgeStats>,
}

impl BridgeServer {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let query = QueryClient::from_config(&config.ollama)?;
        Ok(Self::with_query_client(config, transport, query))
    }

    /// Build with an already configured query client.
    pub fn with_query_client(config: Config, transport: Arc<dyn Transport>, query: QueryClient) -> Self {
        let stats = Arc::new(BridgeStats::new());
        let (supervisor, inbound_rx) = ConnectionSupervisor::new(
            transport,
            SupervisorSettings::from_config(&config.meshtastic),
            Arc::clone(&stats),
        );
        let router = MessageRouter::from_config(
            &config.bridge,
            Arc::new(query),
            Arc::clone(&supervisor),
            Arc::clone(&stats),
        );
        Self {
            config,
            supervisor,
            router,
            inbound_rx: Some(inbound_rx),
            stats,
        }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Run until Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` resolves or the link fails for good.
    ///
    /// Returns an error when the supervisor ends in `Failed`.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut inbound = self
            .inbound_rx
            .take()
            .ok_or_else(|| anyhow!("bridge server can only run once"))?;

        info!(
            "meshai bridge starting: prefix '{}', model '{}', link {}",
            self.router.prefix(),
            self.config.ollama.model,
            self.config.meshtastic.connection_type
        );

        let mut state_rx = self.supervisor.subscribe_state();

        if self.config.meshtastic.require_device_at_startup {
            if let ConnectOutcome::Failed { attempts, last_error } = self.supervisor.connect().await {
                return Err(anyhow!(
                    "radio link failed after {} attempts: {}",
                    attempts,
                    last_error
                ));
            }
        } else {
            let initial = self.supervisor.spawn_connect();
            tokio::spawn(async move {
                if let Ok(ConnectOutcome::Connected(handle)) = initial.await {
                    debug!("initial connect ready ({})", handle.describe());
                }
            });
        }

        let health = HealthMonitor::spawn(
            Arc::clone(&self.supervisor),
            HealthSettings::from_config(&self.config.meshtastic),
            Arc::clone(&self.stats),
        );

        let stats_every = self.config.bridge.stats_interval_secs;
        let mut stats_tick = tokio::time::interval(Duration::from_secs(stats_every.max(1)));
        stats_tick.tick().await;

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                event = inbound.recv() => match event {
                    Some(msg) => {
                        self.router.handle(msg);
                    }
                    None => {
                        warn!("Inbound event stream closed");
                        break Ok(());
                    }
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let state = *state_rx.borrow_and_update();
                    if state == ConnectionState::Failed {
                        let attempts = self.supervisor.attempts();
                        let last_error = self.supervisor.last_error().unwrap_or_default();
                        error!("radio link failed after {} attempts: {}", attempts, last_error);
                        break Err(anyhow!(
                            "radio link failed after {} attempts: {}",
                            attempts,
                            last_error
                        ));
                    }
                    info!("Radio link {}", state);
                }
                _ = stats_tick.tick(), if stats_every > 0 => {
                    info!("stats: {}", self.stats.snapshot().summary());
                }
            }
        };

        health.stop().await;
        let pending = self.router.in_flight();
        if pending > 0 {
            info!("Waiting for {} in-flight queries", pending);
        }
        self.router.drain().await;
        self.supervisor.disconnect().await;
        info!("meshai bridge stopped: {}", self.stats.snapshot().summary());
        result
    }
}
