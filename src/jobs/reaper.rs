//! Background sweep over the job table.
//!
//! One loop serves two purposes: physically removing records past their TTL,
//! and failing `processing` records whose worker evidently died (watchdog).

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::JobsConfig;
use crate::jobs::JobRegistry;

/// Periodic TTL reaper and stuck-job watchdog.
pub struct Reaper {
    registry: Arc<JobRegistry>,
    config: JobsConfig,
}

impl Reaper {
    pub fn new(registry: Arc<JobRegistry>, config: JobsConfig) -> Self {
        Self { registry, config }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.config.reap_interval, "starting job reaper loop");

        let mut interval = tokio::time::interval(self.config.reap_interval);
        // First tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("job reaper shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One reap + watchdog pass.
    pub async fn sweep_once(&self) {
        if let Err(e) = self.registry.reap_expired().await {
            tracing::error!(error = %e, "reap pass failed");
        }
        if let Err(e) = self.registry.watchdog_sweep().await {
            tracing::error!(error = %e, "watchdog pass failed");
        }
    }
}
