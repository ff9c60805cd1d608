//! Periodic reconciliation task.
//!
//! Soak expiry, apply/rollback timeouts, redelivery to reconnected devices
//! and deferred writes are all handled here, on a fixed cadence, so that
//! promotion timing never depends on message arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::engine::{ReconcileReport, RolloutEngine};

/// Default pass interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Runs [`RolloutEngine::reconcile`] until shutdown.
pub struct Reconciler {
    engine: Arc<RolloutEngine>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(engine: Arc<RolloutEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Run a single pass.
    pub async fn tick(&self) -> ReconcileReport {
        self.engine.reconcile().await
    }

    /// Run until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "rollout reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("rollout reconciler shutting down");
                    break;
                }
            }
        }
    }
}
