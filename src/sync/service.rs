use std::time::Duration;

use async_trait::async_trait;
use log::info;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use tokio::time::{interval, MissedTickBehavior};

use super::Reconciler;
use crate::core::status;

/// Runs a reconcile pass every `interval` until shutdown.
///
/// Passes never overlap: a pass that outlives its tick delays the next one.
pub struct SyncService {
    reconciler: Reconciler,
    interval: Duration,
}

impl SyncService {
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }
}

#[async_trait]
impl BackgroundService for SyncService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        info!("Starting upstream sync every {:?}", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping upstream sync");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    let report = self.reconciler.run_pass().await;
                    let failed = &report.failed;
                    if !failed.is_empty() {
                        info!("Upstreams left out of sync until the next pass: {failed:?}");
                    }
                    status::mark_synced();
                }
            }
        }
    }
}
