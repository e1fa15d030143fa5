//! Advisory OSD health monitoring.
//!
//! Periodically reads the data plane's daemon map and reports daemons which
//! have been down longer than the configured grace period. The monitor only
//! ever logs; acting on a down daemon is the platform's job, and restart
//! storms from an over-eager monitor are worse than a down OSD.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dataplane::{DataPlane, OsdDumpEntry};

/// Watches daemon liveness as reported by the data plane.
pub struct OsdHealthMonitor {
    config: Arc<Config>,
    dataplane: Arc<dyn DataPlane>,
    shutdown: broadcast::Receiver<()>,
    /// When each currently-down daemon was first seen down.
    down_since: HashMap<i32, Instant>,
}

impl OsdHealthMonitor {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, dataplane: Arc<dyn DataPlane>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            config,
            dataplane,
            shutdown,
            down_since: HashMap::new(),
        }
    }

    /// Spawn the monitor loop onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.health_check_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => self.check().await,
                _ = self.shutdown.recv() => {
                    tracing::debug!("health monitor shutting down");
                    return;
                }
            }
        }
    }

    async fn check(&mut self) {
        let dump = match self.dataplane.osd_dump().await {
            Ok(dump) => dump,
            Err(err) => {
                tracing::warn!(error = ?err, "error reading the daemon map for the health check");
                return;
            }
        };
        for id in self.observe(&dump, Instant::now()) {
            tracing::warn!(osd = id, grace_secs = self.config.health_down_grace_secs, "OSD has been down past the grace period");
        }
    }

    /// Fold one daemon map observation in, returning the ids down past grace.
    pub fn observe(&mut self, dump: &[OsdDumpEntry], now: Instant) -> Vec<i32> {
        let grace = Duration::from_secs(self.config.health_down_grace_secs);
        let mut over_grace = Vec::new();
        for entry in dump {
            if entry.is_up() {
                self.down_since.remove(&entry.osd);
                continue;
            }
            let since = *self.down_since.entry(entry.osd).or_insert(now);
            if now.duration_since(since) >= grace {
                over_grace.push(entry.osd);
                // Restart the grace period so a persistently down daemon is
                // reported once per period, not once per check.
                self.down_since.insert(entry.osd, now);
            }
        }
        // Daemons absent from the map are forgotten, not reported.
        self.down_since.retain(|id, _| dump.iter().any(|entry| entry.osd == *id));
        over_grace
    }
}
