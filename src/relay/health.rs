//! Health Monitor
//!
//! Three periodic sweeps over the client registry, each on its own cadence:
//!
//! - broken sweep (fast): evicts clients whose transport is closed or whose
//!   liveness hit dead; detection must be cheap and quick.
//! - ping sweep (medium): WebSocket ping probes keep connections alive
//!   through intermediary proxies and drive the liveness state machine;
//!   pings are network-visible, so this runs less often and never evicts.
//! - idle sweep (slow): coarse cleanup of clients that are technically
//!   connected but stopped participating.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::relay::registry::ClientRegistry;

/// Sweep cadences and eviction thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Broken-connection sweep interval.
    pub broken_interval: Duration,
    /// Ping sweep interval; also the activity grace before a client is put
    /// on the pong clock.
    pub ping_interval: Duration,
    /// Idle sweep interval.
    pub idle_interval: Duration,
    /// Inactivity threshold for idle eviction.
    pub idle_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            broken_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
            idle_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Periodic connection-health sweeps over a client registry.
pub struct HealthMonitor {
    registry: Arc<ClientRegistry>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a monitor over the given registry.
    pub fn new(registry: Arc<ClientRegistry>, config: HealthConfig) -> Self {
        Self { registry, config }
    }

    /// Spawn the three sweep loops. All loops stop when the shutdown
    /// channel fires.
    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let broken = {
            let monitor = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.broken_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { monitor.sweep_broken().await; }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        let ping = {
            let monitor = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.ping_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { monitor.sweep_ping().await; }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        let idle = {
            let monitor = self;
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.idle_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { monitor.sweep_idle().await; }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        vec![broken, ping, idle]
    }

    /// Evict clients with a closed transport or dead liveness. Returns the
    /// number removed.
    pub async fn sweep_broken(&self) -> usize {
        let removed = self.registry.remove_broken().await;
        if !removed.is_empty() {
            info!(count = removed.len(), "broken clients removed");
        }
        removed.len()
    }

    /// Probe every live client and advance the liveness state machine.
    /// Returns the number of pings queued. Never evicts.
    pub async fn sweep_ping(&self) -> usize {
        let targets = self.registry.begin_ping_round(self.config.ping_interval).await;
        let mut pinged = 0;
        for (id, connection) in targets {
            match connection.ping() {
                Ok(()) => pinged += 1,
                Err(e) => {
                    // The broken sweep will collect this client.
                    debug!(client_id = %id, error = %e, "ping probe failed");
                }
            }
        }
        pinged
    }

    /// Evict clients idle for longer than the configured threshold, even if
    /// their transport reports itself open. Returns the number removed.
    pub async fn sweep_idle(&self) -> usize {
        let removed = self.registry.remove_idle(self.config.idle_timeout).await;
        if !removed.is_empty() {
            info!(count = removed.len(), "idle clients removed");
        }
        removed.len()
    }
}
